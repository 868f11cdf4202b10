//! Block graph and type-flow analysis
//!
//! The analyzer splits a method into basic blocks, prunes blocks nothing can
//! reach, and then iterates a type-flow pass to a fixpoint. The result tells
//! the emitter, for every block, which locals can enter in a register with a
//! known primitive type and which are dead on entry, and for every
//! instruction, which types it pushes and pops.
//!
//! Starts only ever move `NONE -> T -> NONE`: a local whose incoming type
//! was once settled and later changed is demoted for good. Together with the
//! monotone reset and forced sets this bounds the number of iterations.

use crate::bytecode::{decode_all, Instruction, MethodInfo, Opcode, ParamType};
use crate::error::{Error, Result};
use crate::runtime::StackType;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// How the emitter lowers an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lowering {
    /// Typed operands on the static stack
    Native,
    /// Interpreter routine on synced memory state, with the type of the
    /// single value it pushes when that type is known
    Generic(Option<StackType>),
}

/// Lowering class of `op`
pub fn lowering(op: Opcode) -> Lowering {
    use Opcode::*;
    match op {
        Bkpt | Nop | Label | Debug | DebugLine | DebugFile | PushNull | PushUndefined
        | PushByte | PushShort | PushTrue | PushFalse | PushNaN | PushString | PushInt
        | PushUInt | PushDouble | PushNamespace | Pop | Dup | Swap | GetLocal | GetLocal0
        | GetLocal1 | GetLocal2 | GetLocal3 | SetLocal | SetLocal0 | SetLocal1 | SetLocal2
        | SetLocal3 | Kill | Add | Subtract | Multiply | Divide | Modulo | AddI | SubtractI
        | MultiplyI | Negate | NegateI | Increment | IncrementI | Decrement | DecrementI
        | LShift | RShift | URShift | BitAnd | BitOr | BitXor | BitNot | Not | Equals
        | StrictEquals | LessThan | LessEquals | GreaterThan | GreaterEquals | ConvertS
        | CoerceS | EscXAttr | TypeOf | ConvertI | CoerceI | ConvertU | CoerceU | ConvertD
        | CoerceD | ConvertB | CoerceB | CoerceA | ConvertO | CoerceO | Jump | IfTrue
        | IfFalse | IfEq | IfNe | IfLt | IfLe | IfGt | IfGe | IfNlt | IfNle | IfNgt | IfNge
        | IfStrictEq | IfStrictNe | LookupSwitch | ReturnVoid | ReturnValue | Throw => {
            Lowering::Native
        }

        NewFunction | NewActivation | NewCatch | GetGlobalScope | GetScopeObject | GetSlot
        | GetGlobalSlot => Lowering::Generic(Some(StackType::Object)),

        InstanceOf | IsType | IsTypeLate | In | DeleteProperty | HasNext2 => {
            Lowering::Generic(Some(StackType::Boolean))
        }

        _ => Lowering::Generic(None),
    }
}

/// Locals a generic instruction reads and writes in memory
pub fn memory_locals(instr: &Instruction) -> Result<Vec<u32>> {
    Ok(match instr.opcode {
        Opcode::HasNext2 => vec![instr.index()?, instr.second()?],
        Opcode::IncLocal | Opcode::DecLocal | Opcode::IncLocalI | Opcode::DecLocalI => {
            vec![instr.index()?]
        }
        _ => Vec::new(),
    })
}

/// Type of local `param + 1` on method entry
fn param_stack_type(param: ParamType) -> StackType {
    match param {
        ParamType::Int => StackType::Int,
        ParamType::UInt => StackType::UInt,
        ParamType::Number => StackType::Number,
        ParamType::Boolean => StackType::Boolean,
        ParamType::Any | ParamType::String => StackType::None,
    }
}

/// Common type of all incoming types, NONE on disagreement or no input
fn meet<I: IntoIterator<Item = StackType>>(types: I) -> StackType {
    let mut types = types.into_iter();
    let Some(first) = types.next() else {
        return StackType::None;
    };
    if types.all(|ty| ty == first) {
        first
    } else {
        StackType::None
    }
}

/// One basic block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockInfo {
    pub start: u32,
    /// Offset just past the last instruction
    pub end: u32,
    pub is_handler: bool,
    pub preds: BTreeSet<u32>,
    pub succs: BTreeSet<u32>,
    /// Type of each local on entry
    pub locals_start: Vec<StackType>,
    /// Type of each local on exit
    pub locals: Vec<StackType>,
    /// Dead on entry along every continuation
    pub locals_reset: Vec<bool>,
    pub locals_used: Vec<bool>,
    #[serde(skip)]
    own_reset: Vec<bool>,
    #[serde(skip)]
    demoted: Vec<bool>,
    #[serde(skip)]
    first: usize,
    #[serde(skip)]
    last: usize,
}

impl BlockInfo {
    fn new(start: u32, end: u32, first: usize, last: usize, locals: usize) -> Self {
        Self {
            start,
            end,
            is_handler: false,
            preds: BTreeSet::new(),
            succs: BTreeSet::new(),
            locals_start: vec![StackType::None; locals],
            locals: vec![StackType::None; locals],
            locals_reset: vec![false; locals],
            locals_used: vec![false; locals],
            own_reset: vec![false; locals],
            demoted: vec![false; locals],
            first,
            last,
        }
    }
}

/// Frozen output of the analysis, consumed immutably by the emitter
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub method: String,
    pub local_count: u32,
    pub blocks: BTreeMap<u32, BlockInfo>,
    /// Type pushed by each instruction (absent for stack shuffles)
    pub push_types: HashMap<u32, StackType>,
    /// Types popped by each instruction, top of stack first
    pub operand_types: HashMap<u32, Vec<StackType>>,
    pub iterations: u32,
    #[serde(skip)]
    pub instructions: Vec<Instruction>,
}

impl AnalysisResult {
    pub fn block(&self, start: u32) -> Option<&BlockInfo> {
        self.blocks.get(&start)
    }

    pub fn push_type(&self, ip: u32) -> Option<StackType> {
        self.push_types.get(&ip).copied()
    }

    pub fn operand_types(&self, ip: u32) -> &[StackType] {
        self.operand_types
            .get(&ip)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn instructions_of(&self, block: &BlockInfo) -> &[Instruction] {
        &self.instructions[block.first..block.last]
    }
}

/// Run the block-graph builder and the type-flow fixpoint over `method`
pub fn analyze(method: &MethodInfo) -> Result<AnalysisResult> {
    let mut analyzer = Analyzer::new(method)?;
    analyzer.prune();
    analyzer.solve()
}

struct Analyzer<'m> {
    method: &'m MethodInfo,
    instructions: Vec<Instruction>,
    local_count: usize,
    blocks: BTreeMap<u32, BlockInfo>,
    forced: HashSet<u32>,
    push_types: HashMap<u32, StackType>,
    operand_types: HashMap<u32, Vec<StackType>>,
}

impl<'m> Analyzer<'m> {
    // ==================== Block discovery ====================

    fn new(method: &'m MethodInfo) -> Result<Self> {
        let body = &method.body;
        let instructions = decode_all(&body.code)?;
        let local_count = body.local_count as usize;
        let code_len = body.code.len() as u32;
        let index: HashMap<u32, usize> = instructions
            .iter()
            .enumerate()
            .map(|(i, instr)| (instr.offset, i))
            .collect();

        let handlers: BTreeSet<u32> = body.exceptions.iter().map(|e| e.target).collect();
        let mut starts = BTreeSet::new();
        starts.insert(0);
        starts.extend(handlers.iter().copied());
        for instr in &instructions {
            starts.extend(instr.jump_targets());
            let op = instr.opcode;
            if (op.is_branch() || op.is_terminator()) && instr.next < code_len {
                starts.insert(instr.next);
            }
            if op == Opcode::Label {
                starts.insert(instr.offset);
            }
        }

        let mut blocks = BTreeMap::new();
        if instructions.is_empty() {
            if let Some(&target) = handlers.iter().next() {
                return Err(Error::format_error(
                    "handler target outside of code",
                    target as usize,
                ));
            }
            blocks.insert(0, BlockInfo::new(0, 0, 0, 0, local_count));
        } else {
            let starts: Vec<u32> = starts.into_iter().collect();
            for (k, &start) in starts.iter().enumerate() {
                let first = *index.get(&start).ok_or_else(|| {
                    Error::format_error("block start inside an instruction", start as usize)
                })?;
                let (last, end) = match starts.get(k + 1) {
                    Some(next) => {
                        let last = *index.get(next).ok_or_else(|| {
                            Error::format_error("block start inside an instruction", *next as usize)
                        })?;
                        (last, *next)
                    }
                    None => (instructions.len(), code_len),
                };
                let mut block = BlockInfo::new(start, end, first, last, local_count);
                block.is_handler = handlers.contains(&start);
                blocks.insert(start, block);
            }
        }

        let mut analyzer = Self {
            method,
            instructions,
            local_count,
            blocks,
            forced: HashSet::default(),
            push_types: HashMap::default(),
            operand_types: HashMap::default(),
        };
        analyzer.link(code_len);
        Ok(analyzer)
    }

    fn link(&mut self, code_len: u32) {
        let mut edges = Vec::new();
        for block in self.blocks.values() {
            if block.last == block.first {
                continue;
            }
            let instr = &self.instructions[block.last - 1];
            let fallthrough = (instr.next < code_len).then_some(instr.next);
            let succs: Vec<u32> = match instr.opcode {
                Opcode::Jump | Opcode::LookupSwitch => instr.jump_targets(),
                Opcode::Throw | Opcode::ReturnVoid | Opcode::ReturnValue => Vec::new(),
                op if op.is_branch() => {
                    let mut succs = instr.jump_targets();
                    succs.extend(fallthrough);
                    succs
                }
                _ => fallthrough.into_iter().collect(),
            };
            edges.extend(succs.into_iter().map(|succ| (block.start, succ)));
        }
        for (from, to) in edges {
            if let Some(block) = self.blocks.get_mut(&from) {
                block.succs.insert(to);
            }
            if let Some(block) = self.blocks.get_mut(&to) {
                block.preds.insert(from);
            }
        }
    }

    /// Drop blocks with no predecessors until none are left
    fn prune(&mut self) {
        loop {
            let dead: Vec<u32> = self
                .blocks
                .values()
                .filter(|b| b.start != 0 && !b.is_handler && b.preds.is_empty())
                .map(|b| b.start)
                .collect();
            if dead.is_empty() {
                return;
            }
            for start in dead {
                trace!(method = %self.method.name, block = start, "pruning unreachable block");
                if let Some(block) = self.blocks.remove(&start) {
                    for succ in block.succs {
                        if let Some(target) = self.blocks.get_mut(&succ) {
                            target.preds.remove(&start);
                        }
                    }
                }
            }
        }
    }

    // ==================== Fixpoint ====================

    fn solve(mut self) -> Result<AnalysisResult> {
        if let Some(entry) = self.blocks.get_mut(&0) {
            if !entry.is_handler {
                for (i, param) in self.method.param_types.iter().enumerate() {
                    if let Some(slot) = entry.locals_start.get_mut(i + 1) {
                        *slot = param_stack_type(*param);
                    }
                }
            }
        }

        let order: Vec<u32> = self.blocks.keys().copied().collect();
        let limit = 16 + 2 * order.len() * self.local_count + self.instructions.len();
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations as usize > limit {
                return Err(Error::unsupported(format!(
                    "type analysis of {} did not converge",
                    self.method.name
                )));
            }
            self.push_types.clear();
            self.operand_types.clear();
            let forced_before = self.forced.len();
            let mut changed = false;

            let mut walked: HashSet<u32> = HashSet::default();
            for &start in &order {
                if iterations == 1 {
                    self.seed_start(start, &walked);
                }
                let walk = self.walk(start)?;
                if let Some(block) = self.blocks.get_mut(&start) {
                    if block.locals != walk.exit
                        || block.locals_used != walk.used
                        || block.own_reset != walk.own_reset
                    {
                        block.locals = walk.exit;
                        block.locals_used = walk.used;
                        block.own_reset = walk.own_reset;
                        changed = true;
                    }
                }
                walked.insert(start);
            }

            changed |= self.propagate_resets();
            changed |= self.propagate_starts();
            changed |= self.forced.len() != forced_before;
            trace!(method = %self.method.name, iteration = iterations, changed, "analysis pass");
            if !changed {
                break;
            }
        }

        self.check_entry_back_edges()?;
        debug!(
            method = %self.method.name,
            blocks = self.blocks.len(),
            iterations,
            "analysis converged"
        );
        Ok(AnalysisResult {
            method: self.method.name.clone(),
            local_count: self.local_count as u32,
            blocks: self.blocks,
            push_types: self.push_types,
            operand_types: self.operand_types,
            iterations,
            instructions: self.instructions,
        })
    }

    /// First pass: derive a start from the predecessors walked so far
    fn seed_start(&mut self, start: u32, walked: &HashSet<u32>) {
        let Some(block) = self.blocks.get(&start) else {
            return;
        };
        if start == 0 || block.is_handler {
            return;
        }
        let exits: Vec<&Vec<StackType>> = block
            .preds
            .iter()
            .filter(|p| walked.contains(*p))
            .filter_map(|p| self.blocks.get(p))
            .map(|p| &p.locals)
            .collect();
        let seeded: Vec<StackType> = (0..self.local_count)
            .map(|i| meet(exits.iter().map(|exit| exit[i])))
            .collect();
        if let Some(block) = self.blocks.get_mut(&start) {
            block.locals_start = seeded;
        }
    }

    fn walk(&mut self, start: u32) -> Result<BlockWalk> {
        let block = self
            .blocks
            .get(&start)
            .ok_or_else(|| Error::internal(format!("no block at {}", start)))?;
        let (first, last) = (block.first, block.last);
        let mut walker = Walker {
            locals: block.locals_start.clone(),
            used: vec![false; self.local_count],
            read: vec![false; self.local_count],
            own_reset: vec![false; self.local_count],
            stack: Vec::new(),
            forced: &mut self.forced,
            push_types: &mut self.push_types,
            operand_types: &mut self.operand_types,
        };
        for instr in &self.instructions[first..last] {
            let protected = self
                .method
                .body
                .exceptions
                .iter()
                .any(|e| e.covers(instr.offset));
            walker.step(instr, protected)?;
        }
        Ok(BlockWalk {
            exit: walker.locals,
            used: walker.used,
            own_reset: walker.own_reset,
        })
    }

    fn propagate_resets(&mut self) -> bool {
        let mut changed = false;
        for block in self.blocks.values_mut() {
            for i in 0..self.local_count {
                if block.own_reset[i] && !block.locals_reset[i] {
                    block.locals_reset[i] = true;
                    changed = true;
                }
            }
        }
        loop {
            let mut updates = Vec::new();
            for block in self.blocks.values() {
                for i in 0..self.local_count {
                    if block.locals_reset[i] || block.locals_used[i] {
                        continue;
                    }
                    let all_dead = block.succs.iter().all(|s| {
                        self.blocks
                            .get(s)
                            .map_or(true, |succ| succ.locals_reset[i])
                    });
                    if all_dead {
                        updates.push((block.start, i));
                    }
                }
            }
            if updates.is_empty() {
                return changed;
            }
            for (start, i) in updates {
                if let Some(block) = self.blocks.get_mut(&start) {
                    block.locals_reset[i] = true;
                }
            }
            changed = true;
        }
    }

    fn propagate_starts(&mut self) -> bool {
        let mut changed = false;
        let starts: Vec<u32> = self.blocks.keys().copied().collect();
        for start in starts {
            let Some(block) = self.blocks.get(&start) else {
                continue;
            };
            if start == 0 || block.is_handler {
                continue;
            }
            let incoming: Vec<StackType> = (0..self.local_count)
                .map(|i| {
                    if block.demoted[i] || block.locals_reset[i] {
                        StackType::None
                    } else {
                        meet(
                            block
                                .preds
                                .iter()
                                .filter_map(|p| self.blocks.get(p))
                                .map(|p| p.locals[i]),
                        )
                    }
                })
                .collect();
            let Some(block) = self.blocks.get_mut(&start) else {
                continue;
            };
            for (i, new) in incoming.into_iter().enumerate() {
                let old = block.locals_start[i];
                if new == old {
                    continue;
                }
                if old == StackType::None {
                    block.locals_start[i] = new;
                } else {
                    block.locals_start[i] = StackType::None;
                    block.demoted[i] = true;
                }
                changed = true;
            }
        }
        changed
    }

    /// The entry block's start types come from the signature and cannot
    /// be weakened, so a loop back to it must preserve them
    fn check_entry_back_edges(&self) -> Result<()> {
        let Some(entry) = self.blocks.get(&0) else {
            return Ok(());
        };
        for pred in entry.preds.iter().filter_map(|p| self.blocks.get(p)) {
            for i in 0..self.local_count {
                let expected = entry.locals_start[i];
                if expected != StackType::None
                    && !entry.locals_reset[i]
                    && pred.locals[i] != expected
                {
                    return Err(Error::unsupported(format!(
                        "back edge from {} into the entry of {} leaves local {} as {} instead of {}",
                        pred.start, self.method.name, i, pred.locals[i], expected
                    )));
                }
            }
        }
        Ok(())
    }
}

struct BlockWalk {
    exit: Vec<StackType>,
    used: Vec<bool>,
    own_reset: Vec<bool>,
}

/// A value on the tracked stack and the instruction that pushed it
#[derive(Debug, Clone, Copy)]
struct Tracked {
    producer: u32,
    ty: StackType,
    /// Whether the producer's push type may still be narrowed to INT
    forceable: bool,
}

/// Abstract interpretation of one block
struct Walker<'a> {
    locals: Vec<StackType>,
    used: Vec<bool>,
    read: Vec<bool>,
    own_reset: Vec<bool>,
    stack: Vec<Tracked>,
    forced: &'a mut HashSet<u32>,
    push_types: &'a mut HashMap<u32, StackType>,
    operand_types: &'a mut HashMap<u32, Vec<StackType>>,
}

impl Walker<'_> {
    fn slot(&self, local: u32, ip: u32) -> Result<usize> {
        let slot = local as usize;
        if slot >= self.locals.len() {
            return Err(Error::unsupported(format!(
                "local {} out of range at offset {}",
                local, ip
            )));
        }
        Ok(slot)
    }

    fn pop(&mut self, ip: u32) -> Tracked {
        let entry = self.stack.pop().unwrap_or(Tracked {
            producer: ip,
            ty: StackType::Object,
            forceable: false,
        });
        self.operand_types.entry(ip).or_default().push(entry.ty);
        entry
    }

    fn pop_n(&mut self, ip: u32, n: usize) {
        for _ in 0..n {
            self.pop(ip);
        }
    }

    /// Pop an operand the instruction truncates to int32 anyway
    fn pop_int32(&mut self, ip: u32) {
        let entry = self.pop(ip);
        if entry.forceable && entry.producer != ip && entry.ty != StackType::Int {
            self.forced.insert(entry.producer);
        }
    }

    fn push_value(&mut self, ip: u32, natural: StackType) {
        let ty = if self.forced.contains(&ip) {
            StackType::Int
        } else {
            natural
        };
        self.push_types.insert(ip, ty);
        self.stack.push(Tracked {
            producer: ip,
            ty,
            forceable: true,
        });
    }

    fn repush(&mut self, ip: u32, ty: StackType) {
        self.stack.push(Tracked {
            producer: ip,
            ty,
            forceable: false,
        });
    }

    fn read_memory(&mut self, slot: usize) {
        self.used[slot] = true;
        self.read[slot] = true;
    }

    fn write(&mut self, slot: usize, ty: StackType) {
        self.used[slot] = true;
        if !self.read[slot] {
            self.own_reset[slot] = true;
        }
        self.locals[slot] = ty;
    }

    /// Nothing after a return or throw reads a local
    fn leave(&mut self) {
        for slot in 0..self.locals.len() {
            if !self.read[slot] {
                self.own_reset[slot] = true;
            }
        }
    }

    fn step(&mut self, instr: &Instruction, protected: bool) -> Result<()> {
        let ip = instr.offset;
        if protected {
            self.used.fill(true);
            self.read.fill(true);
        }
        match lowering(instr.opcode) {
            Lowering::Native => self.native(instr),
            Lowering::Generic(push) => {
                for local in memory_locals(instr)? {
                    let slot = self.slot(local, ip)?;
                    self.read_memory(slot);
                    self.locals[slot] = StackType::None;
                }
                self.stack.clear();
                if let Some(ty) = push {
                    self.push_value(ip, ty);
                }
                Ok(())
            }
        }
    }

    fn native(&mut self, instr: &Instruction) -> Result<()> {
        use Opcode::*;
        use StackType as T;
        let ip = instr.offset;
        match instr.opcode {
            Bkpt | Nop | Label | Debug | DebugLine | DebugFile | Jump => {}

            PushNull | PushUndefined | PushString | PushNamespace | PushNaN => {
                self.push_value(ip, T::Object)
            }
            PushByte | PushShort | PushInt => self.push_value(ip, T::Int),
            PushUInt => self.push_value(ip, T::UInt),
            PushDouble => self.push_value(ip, T::Number),
            PushTrue | PushFalse => self.push_value(ip, T::Boolean),

            Pop => self.pop_n(ip, 1),
            Dup => {
                let top = self.pop(ip);
                self.repush(ip, top.ty);
                self.repush(ip, top.ty);
            }
            Swap => {
                let b = self.pop(ip);
                let a = self.pop(ip);
                self.repush(ip, b.ty);
                self.repush(ip, a.ty);
            }

            GetLocal | GetLocal0 | GetLocal1 | GetLocal2 | GetLocal3 => {
                let slot = self.slot(instr.local_index()?, ip)?;
                self.read_memory(slot);
                if self.locals[slot] == T::None {
                    self.locals[slot] = T::Object;
                }
                let ty = self.locals[slot];
                self.push_value(ip, ty);
            }
            SetLocal | SetLocal0 | SetLocal1 | SetLocal2 | SetLocal3 => {
                let slot = self.slot(instr.local_index()?, ip)?;
                let value = self.pop(ip);
                self.write(slot, value.ty);
            }
            Kill => {
                let slot = self.slot(instr.index()?, ip)?;
                self.write(slot, T::None);
            }

            Add => {
                let b = self.pop(ip);
                let a = self.pop(ip);
                let ty = if a.ty == T::Object || b.ty == T::Object {
                    T::Object
                } else {
                    T::Number
                };
                self.push_value(ip, ty);
            }
            Subtract | Multiply | Divide | Modulo => {
                self.pop_n(ip, 2);
                self.push_value(ip, T::Number);
            }
            AddI | SubtractI | MultiplyI => {
                self.pop_n(ip, 2);
                self.push_value(ip, T::Int);
            }
            Negate | Increment | Decrement | ConvertD | CoerceD => {
                self.pop_n(ip, 1);
                self.push_value(ip, T::Number);
            }
            NegateI | IncrementI | DecrementI | ConvertI | CoerceI => {
                self.pop_n(ip, 1);
                self.push_value(ip, T::Int);
            }
            ConvertU | CoerceU => {
                self.pop_n(ip, 1);
                self.push_value(ip, T::UInt);
            }

            LShift | RShift | BitAnd | BitOr | BitXor => {
                self.pop_int32(ip);
                self.pop_int32(ip);
                self.push_value(ip, T::Int);
            }
            URShift => {
                self.pop_int32(ip);
                self.pop_int32(ip);
                self.push_value(ip, T::UInt);
            }
            BitNot => {
                self.pop_int32(ip);
                self.push_value(ip, T::Int);
            }

            Not | ConvertB | CoerceB => {
                self.pop_n(ip, 1);
                self.push_value(ip, T::Boolean);
            }
            Equals | StrictEquals | LessThan | LessEquals | GreaterThan | GreaterEquals => {
                self.pop_n(ip, 2);
                self.push_value(ip, T::Boolean);
            }
            ConvertS | CoerceS | EscXAttr | TypeOf => {
                self.pop_n(ip, 1);
                self.push_value(ip, T::Object);
            }
            CoerceA | ConvertO | CoerceO => {
                let value = self.pop(ip);
                self.push_value(ip, value.ty);
            }

            IfTrue | IfFalse | LookupSwitch => self.pop_n(ip, 1),
            IfEq | IfNe | IfLt | IfLe | IfGt | IfGe | IfNlt | IfNle | IfNgt | IfNge
            | IfStrictEq | IfStrictNe => self.pop_n(ip, 2),
            ReturnVoid => self.leave(),
            ReturnValue | Throw => {
                self.pop_n(ip, 1);
                self.leave();
            }

            op => {
                return Err(Error::internal(format!(
                    "{} is not lowered natively",
                    op
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeBuilder, ExceptionInfo, MethodBody};
    use pretty_assertions::assert_eq;

    fn method(mut b: CodeBuilder, locals: u32) -> MethodInfo {
        MethodInfo::new("m", MethodBody::new(b.finish().unwrap(), 8, locals))
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let mut b = CodeBuilder::new();
        b.push_byte(5).push_byte(3).op(Opcode::Subtract).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 1)).unwrap();
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.push_type(0), Some(StackType::Int));
        assert_eq!(result.push_type(4), Some(StackType::Number));
        assert_eq!(result.operand_types(4), &[StackType::Int, StackType::Int]);
    }

    #[test]
    fn test_unreachable_blocks_are_pruned() {
        // jump over a label block that nothing branches to
        let mut b = CodeBuilder::new();
        let end = b.new_label();
        b.jump(end);
        b.op(Opcode::Label).push_byte(1).op(Opcode::Pop);
        b.bind(end).op(Opcode::ReturnVoid);
        let result = analyze(&method(b, 1)).unwrap();
        let starts: Vec<u32> = result.blocks.keys().copied().collect();
        assert_eq!(starts, vec![0, 8]);
        assert!(result.block(8).unwrap().preds.contains(&0));
    }

    #[test]
    fn test_pruning_cascades() {
        // two dead blocks in a row: the second only loses its predecessor
        // once the first is gone
        let mut b = CodeBuilder::new();
        let end = b.new_label();
        b.op(Opcode::ReturnVoid);
        b.op(Opcode::Label).push_byte(1).op(Opcode::Pop).jump(end);
        b.bind(end).op(Opcode::ReturnVoid);
        let result = analyze(&method(b, 1)).unwrap();
        assert_eq!(result.blocks.keys().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_disagreeing_predecessors_force_memory() {
        let mut b = CodeBuilder::new();
        let (other, join) = (b.new_label(), b.new_label());
        b.get_local(1).branch(Opcode::IfTrue, other);
        b.push_byte(1).set_local(2).jump(join);
        b.bind(other).op(Opcode::PushNull).set_local(2);
        b.bind(join).get_local(2).op(Opcode::ReturnValue);
        let m = method(b, 3);
        let result = analyze(&m).unwrap();

        let join_start = *result.blocks.keys().last().unwrap();
        let join = result.block(join_start).unwrap();
        assert_eq!(join.preds.len(), 2);
        assert_eq!(join.locals_start[2], StackType::None);
        assert!(!join.locals_reset[2]);
    }

    #[test]
    fn test_agreeing_predecessors_keep_the_type() {
        let mut b = CodeBuilder::new();
        let (other, join) = (b.new_label(), b.new_label());
        b.get_local(1).branch(Opcode::IfTrue, other);
        b.push_byte(1).set_local(2).jump(join);
        b.bind(other).push_byte(2).set_local(2);
        b.bind(join).get_local(2).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 3)).unwrap();
        let join_start = *result.blocks.keys().last().unwrap();
        assert_eq!(result.block(join_start).unwrap().locals_start[2], StackType::Int);
    }

    #[test]
    fn test_loop_counter_stays_int() {
        let mut b = CodeBuilder::new();
        let (top, test) = (b.new_label(), b.new_label());
        b.push_byte(0).set_local(1).jump(test);
        b.bind(top).op(Opcode::Label);
        b.get_local(1).push_byte(1).op(Opcode::AddI).set_local(1);
        b.bind(test).get_local(1).push_byte(10).branch(Opcode::IfLt, top);
        b.get_local(1).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 2)).unwrap();
        for block in result.blocks.values().filter(|b| b.start != 0) {
            assert_eq!(block.locals_start[1], StackType::Int, "block {}", block.start);
        }
    }

    #[test]
    fn test_overwritten_local_is_reset() {
        let mut b = CodeBuilder::new();
        let next = b.new_label();
        b.push_byte(1).set_local(1).jump(next);
        b.bind(next).push_byte(2).set_local(1).get_local(1).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 2)).unwrap();
        let block = result.block(7).unwrap();
        assert!(block.locals_reset[1]);
        assert_eq!(block.locals_start[1], StackType::None);
    }

    #[test]
    fn test_reset_propagates_through_untouched_blocks() {
        let mut b = CodeBuilder::new();
        let (middle, last) = (b.new_label(), b.new_label());
        b.push_byte(1).set_local(1).jump(middle);
        b.bind(middle).op(Opcode::Nop).jump(last);
        b.bind(last).push_byte(2).set_local(1).get_local(1).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 2)).unwrap();
        assert!(result.blocks.values().filter(|b| b.start != 0).all(|b| b.locals_reset[1]));
    }

    #[test]
    fn test_shift_forces_producer_to_int() {
        let mut b = CodeBuilder::new();
        b.get_local(1).push_byte(2).op(Opcode::LShift).op(Opcode::ReturnValue);
        let mut m = method(b, 2);
        m.param_types = vec![ParamType::Number];
        let result = analyze(&m).unwrap();
        assert_eq!(result.push_type(0), Some(StackType::Int));
        assert_eq!(result.operand_types(3), &[StackType::Int, StackType::Int]);
        assert_eq!(result.block(0).unwrap().locals[1], StackType::Number);
        assert!(result.iterations >= 2);
    }

    #[test]
    fn test_add_with_object_operand() {
        let mut b = CodeBuilder::new();
        b.op(Opcode::PushNull).push_byte(1).op(Opcode::Add).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 1)).unwrap();
        assert_eq!(result.push_type(3), Some(StackType::Object));
    }

    #[test]
    fn test_generic_op_clears_tracking() {
        let mut b = CodeBuilder::new();
        b.push_byte(1).push_byte(2).op(Opcode::PushScope);
        b.op(Opcode::Pop).op(Opcode::ReturnVoid);
        let result = analyze(&method(b, 1)).unwrap();
        // the pop finds an empty tracked stack
        assert_eq!(result.operand_types(5), &[StackType::Object]);
    }

    #[test]
    fn test_handlers_are_roots_with_unknown_locals() {
        let mut b = CodeBuilder::new();
        b.push_byte(1).op(Opcode::Throw);
        // handler at 3
        b.op(Opcode::Pop).push_byte(0).op(Opcode::ReturnValue);
        let mut m = method(b, 2);
        m.param_types = vec![ParamType::Int];
        m.body.exceptions = vec![ExceptionInfo {
            from: 0,
            to: 3,
            target: 3,
            exc_type: 0,
            var_name: 0,
        }];
        let result = analyze(&m).unwrap();
        let handler = result.block(3).unwrap();
        assert!(handler.is_handler);
        assert!(handler.preds.is_empty());
        assert_eq!(handler.locals_start, vec![StackType::None; 2]);
        assert_eq!(result.block(0).unwrap().locals_start[1], StackType::Int);
        // locals are live across the protected range
        assert!(!result.block(0).unwrap().locals_reset[1]);
    }

    #[test]
    fn test_branch_into_operand_is_a_format_error() {
        let mut b = CodeBuilder::new();
        b.op_u30(Opcode::PushInt, 1).op(Opcode::ReturnValue);
        let mut code = b.finish().unwrap();
        // jump +1 from offset 4 lands on the pushint operand
        code.splice(0..0, [0x10, 0x01, 0x00, 0x00]);
        let m = MethodInfo::new("m", MethodBody::new(code, 2, 1));
        let err = analyze(&m).unwrap_err();
        assert!(err.is_format_error(), "{}", err);
    }

    #[test]
    fn test_entry_back_edge_type_change_is_unsupported() {
        // local 1 enters as int and the loop stores a string into it
        let mut b = CodeBuilder::new();
        let top = b.new_label();
        b.bind(top).get_local(1).op(Opcode::Pop);
        b.op_u30(Opcode::PushString, 1).set_local(1);
        b.get_local(0).branch(Opcode::IfFalse, top);
        b.op(Opcode::ReturnVoid);
        let mut m = method(b, 2);
        m.param_types = vec![ParamType::Int];
        let err = analyze(&m).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)), "{}", err);
    }

    #[test]
    fn test_fixpoint_is_sound() {
        let mut b = CodeBuilder::new();
        let (top, test, odd) = (b.new_label(), b.new_label(), b.new_label());
        b.push_byte(0).set_local(1).push_byte(0).set_local(2).jump(test);
        b.bind(top).op(Opcode::Label);
        b.get_local(1).push_byte(1).op(Opcode::BitAnd).branch(Opcode::IfTrue, odd);
        b.get_local(2).push_byte(1).op(Opcode::Add).set_local(2);
        b.bind(odd).get_local(1).op(Opcode::IncrementI).set_local(1);
        b.bind(test).get_local(1).push_byte(10).branch(Opcode::IfLt, top);
        b.get_local(2).op(Opcode::ReturnValue);
        let result = analyze(&method(b, 3)).unwrap();
        for block in result.blocks.values() {
            for pred in &block.preds {
                let exit = &result.block(*pred).unwrap().locals;
                for (i, ty) in block.locals_start.iter().enumerate() {
                    if *ty != StackType::None {
                        assert_eq!(exit[i], *ty, "local {} into {}", i, block.start);
                    }
                }
            }
        }
    }
}
