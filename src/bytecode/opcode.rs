//! ABC opcodes
//!
//! This module defines the AVM2 instruction set understood by both execution
//! tiers, together with the inline operand layout of every instruction.

/// Inline operand layout of an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLayout {
    /// No inline operands
    None,
    /// One u30 (pool index, local index, argument count, ...)
    U30,
    /// Two u30 (name index + argument count, or two local indices)
    U30U30,
    /// One signed byte (pushbyte)
    I8,
    /// One s24 branch offset relative to the end of the instruction
    Branch,
    /// lookupswitch: s24 default, u30 case count, case_count + 1 s24 offsets
    Switch,
    /// debug: u8, u30, u8, u30
    Debug,
}

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ========== No-ops ==========
    Bkpt = 0x01,
    Nop = 0x02,

    // ========== Exceptions / XML namespaces ==========
    /// Pop a value and throw it
    Throw = 0x03,
    /// Operands: multiname (u30)
    GetSuper = 0x04,
    /// Operands: multiname (u30)
    SetSuper = 0x05,
    /// Operands: string index (u30)
    Dxns = 0x06,
    DxnsLate = 0x07,

    // ========== Locals ==========
    /// Operands: local index (u30)
    Kill = 0x08,
    /// Marks a backward branch target
    Label = 0x09,

    // ========== Branches ==========
    IfNlt = 0x0c,
    IfNle = 0x0d,
    IfNgt = 0x0e,
    IfNge = 0x0f,
    Jump = 0x10,
    IfTrue = 0x11,
    IfFalse = 0x12,
    IfEq = 0x13,
    IfNe = 0x14,
    IfLt = 0x15,
    IfLe = 0x16,
    IfGt = 0x17,
    IfGe = 0x18,
    IfStrictEq = 0x19,
    IfStrictNe = 0x1a,
    LookupSwitch = 0x1b,

    // ========== Scope ==========
    PushWith = 0x1c,
    PopScope = 0x1d,

    // ========== Enumeration ==========
    NextName = 0x1e,
    NextValue = 0x23,
    /// Operands: object local (u30), index local (u30)
    HasNext2 = 0x32,

    // ========== Constants ==========
    PushNull = 0x20,
    PushUndefined = 0x21,
    /// Operands: value (i8)
    PushByte = 0x24,
    /// Operands: value (u30, sign-extended from 16 bits)
    PushShort = 0x25,
    PushTrue = 0x26,
    PushFalse = 0x27,
    PushNaN = 0x28,

    // ========== Stack Operations ==========
    Pop = 0x29,
    Dup = 0x2a,
    Swap = 0x2b,

    // ========== Pool constants ==========
    /// Operands: string index (u30)
    PushString = 0x2c,
    /// Operands: int index (u30)
    PushInt = 0x2d,
    /// Operands: uint index (u30)
    PushUInt = 0x2e,
    /// Operands: double index (u30)
    PushDouble = 0x2f,
    PushScope = 0x30,
    /// Operands: namespace index (u30)
    PushNamespace = 0x31,

    // ========== Functions and calls ==========
    /// Operands: method index (u30)
    NewFunction = 0x40,
    /// Operands: argument count (u30)
    Call = 0x41,
    /// Operands: argument count (u30)
    Construct = 0x42,
    /// Operands: multiname (u30), argument count (u30)
    CallSuper = 0x45,
    /// Operands: multiname (u30), argument count (u30)
    CallProperty = 0x46,
    ReturnVoid = 0x47,
    ReturnValue = 0x48,
    /// Operands: argument count (u30)
    ConstructSuper = 0x49,
    /// Operands: multiname (u30), argument count (u30)
    ConstructProp = 0x4a,
    /// Operands: multiname (u30), argument count (u30)
    CallPropLex = 0x4c,
    /// Operands: multiname (u30), argument count (u30)
    CallSuperVoid = 0x4e,
    /// Operands: multiname (u30), argument count (u30)
    CallPropVoid = 0x4f,
    /// Operands: type parameter count (u30)
    ConstructGenericType = 0x53,

    // ========== Object creation ==========
    /// Operands: property count (u30)
    NewObject = 0x55,
    /// Operands: element count (u30)
    NewArray = 0x56,
    NewActivation = 0x57,
    /// Operands: class index (u30)
    NewClass = 0x58,
    /// Operands: multiname (u30)
    GetDescendants = 0x59,
    /// Operands: exception index (u30)
    NewCatch = 0x5a,

    // ========== Properties ==========
    FindPropStrict = 0x5d,
    FindProperty = 0x5e,
    FindDef = 0x5f,
    GetLex = 0x60,
    SetProperty = 0x61,
    GetLocal = 0x62,
    SetLocal = 0x63,
    GetGlobalScope = 0x64,
    /// Operands: scope index (u30)
    GetScopeObject = 0x65,
    GetProperty = 0x66,
    InitProperty = 0x68,
    DeleteProperty = 0x6a,
    /// Operands: slot index (u30)
    GetSlot = 0x6c,
    SetSlot = 0x6d,
    GetGlobalSlot = 0x6e,
    SetGlobalSlot = 0x6f,

    // ========== Conversions ==========
    ConvertS = 0x70,
    EscXAttr = 0x72,
    ConvertI = 0x73,
    ConvertU = 0x74,
    ConvertD = 0x75,
    ConvertB = 0x76,
    ConvertO = 0x77,
    CheckFilter = 0x78,
    /// Operands: type multiname (u30)
    Coerce = 0x80,
    CoerceB = 0x81,
    CoerceA = 0x82,
    CoerceI = 0x83,
    CoerceD = 0x84,
    CoerceS = 0x85,
    /// Operands: type multiname (u30)
    AsType = 0x86,
    AsTypeLate = 0x87,
    CoerceU = 0x88,
    CoerceO = 0x89,

    // ========== Arithmetic ==========
    Negate = 0x90,
    Increment = 0x91,
    /// Operands: local index (u30)
    IncLocal = 0x92,
    Decrement = 0x93,
    /// Operands: local index (u30)
    DecLocal = 0x94,
    TypeOf = 0x95,
    Not = 0x96,
    BitNot = 0x97,
    Add = 0xa0,
    Subtract = 0xa1,
    Multiply = 0xa2,
    Divide = 0xa3,
    Modulo = 0xa4,
    LShift = 0xa5,
    RShift = 0xa6,
    URShift = 0xa7,
    BitAnd = 0xa8,
    BitOr = 0xa9,
    BitXor = 0xaa,

    // ========== Comparison ==========
    Equals = 0xab,
    StrictEquals = 0xac,
    LessThan = 0xad,
    LessEquals = 0xae,
    GreaterThan = 0xaf,
    GreaterEquals = 0xb0,
    InstanceOf = 0xb1,
    /// Operands: type multiname (u30)
    IsType = 0xb2,
    IsTypeLate = 0xb3,
    In = 0xb4,

    // ========== Integer arithmetic ==========
    IncrementI = 0xc0,
    DecrementI = 0xc1,
    /// Operands: local index (u30)
    IncLocalI = 0xc2,
    /// Operands: local index (u30)
    DecLocalI = 0xc3,
    NegateI = 0xc4,
    AddI = 0xc5,
    SubtractI = 0xc6,
    MultiplyI = 0xc7,

    // ========== Short local access ==========
    GetLocal0 = 0xd0,
    GetLocal1 = 0xd1,
    GetLocal2 = 0xd2,
    GetLocal3 = 0xd3,
    SetLocal0 = 0xd4,
    SetLocal1 = 0xd5,
    SetLocal2 = 0xd6,
    SetLocal3 = 0xd7,

    // ========== Debug information ==========
    Debug = 0xef,
    /// Operands: line (u30)
    DebugLine = 0xf0,
    /// Operands: string index (u30)
    DebugFile = 0xf1,
}

impl Opcode {
    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        let op = match byte {
            0x01 => Bkpt,
            0x02 => Nop,
            0x03 => Throw,
            0x04 => GetSuper,
            0x05 => SetSuper,
            0x06 => Dxns,
            0x07 => DxnsLate,
            0x08 => Kill,
            0x09 => Label,
            0x0c => IfNlt,
            0x0d => IfNle,
            0x0e => IfNgt,
            0x0f => IfNge,
            0x10 => Jump,
            0x11 => IfTrue,
            0x12 => IfFalse,
            0x13 => IfEq,
            0x14 => IfNe,
            0x15 => IfLt,
            0x16 => IfLe,
            0x17 => IfGt,
            0x18 => IfGe,
            0x19 => IfStrictEq,
            0x1a => IfStrictNe,
            0x1b => LookupSwitch,
            0x1c => PushWith,
            0x1d => PopScope,
            0x1e => NextName,
            0x20 => PushNull,
            0x21 => PushUndefined,
            0x23 => NextValue,
            0x24 => PushByte,
            0x25 => PushShort,
            0x26 => PushTrue,
            0x27 => PushFalse,
            0x28 => PushNaN,
            0x29 => Pop,
            0x2a => Dup,
            0x2b => Swap,
            0x2c => PushString,
            0x2d => PushInt,
            0x2e => PushUInt,
            0x2f => PushDouble,
            0x30 => PushScope,
            0x31 => PushNamespace,
            0x32 => HasNext2,
            0x40 => NewFunction,
            0x41 => Call,
            0x42 => Construct,
            0x45 => CallSuper,
            0x46 => CallProperty,
            0x47 => ReturnVoid,
            0x48 => ReturnValue,
            0x49 => ConstructSuper,
            0x4a => ConstructProp,
            0x4c => CallPropLex,
            0x4e => CallSuperVoid,
            0x4f => CallPropVoid,
            0x53 => ConstructGenericType,
            0x55 => NewObject,
            0x56 => NewArray,
            0x57 => NewActivation,
            0x58 => NewClass,
            0x59 => GetDescendants,
            0x5a => NewCatch,
            0x5d => FindPropStrict,
            0x5e => FindProperty,
            0x5f => FindDef,
            0x60 => GetLex,
            0x61 => SetProperty,
            0x62 => GetLocal,
            0x63 => SetLocal,
            0x64 => GetGlobalScope,
            0x65 => GetScopeObject,
            0x66 => GetProperty,
            0x68 => InitProperty,
            0x6a => DeleteProperty,
            0x6c => GetSlot,
            0x6d => SetSlot,
            0x6e => GetGlobalSlot,
            0x6f => SetGlobalSlot,
            0x70 => ConvertS,
            0x72 => EscXAttr,
            0x73 => ConvertI,
            0x74 => ConvertU,
            0x75 => ConvertD,
            0x76 => ConvertB,
            0x77 => ConvertO,
            0x78 => CheckFilter,
            0x80 => Coerce,
            0x81 => CoerceB,
            0x82 => CoerceA,
            0x83 => CoerceI,
            0x84 => CoerceD,
            0x85 => CoerceS,
            0x86 => AsType,
            0x87 => AsTypeLate,
            0x88 => CoerceU,
            0x89 => CoerceO,
            0x90 => Negate,
            0x91 => Increment,
            0x92 => IncLocal,
            0x93 => Decrement,
            0x94 => DecLocal,
            0x95 => TypeOf,
            0x96 => Not,
            0x97 => BitNot,
            0xa0 => Add,
            0xa1 => Subtract,
            0xa2 => Multiply,
            0xa3 => Divide,
            0xa4 => Modulo,
            0xa5 => LShift,
            0xa6 => RShift,
            0xa7 => URShift,
            0xa8 => BitAnd,
            0xa9 => BitOr,
            0xaa => BitXor,
            0xab => Equals,
            0xac => StrictEquals,
            0xad => LessThan,
            0xae => LessEquals,
            0xaf => GreaterThan,
            0xb0 => GreaterEquals,
            0xb1 => InstanceOf,
            0xb2 => IsType,
            0xb3 => IsTypeLate,
            0xb4 => In,
            0xc0 => IncrementI,
            0xc1 => DecrementI,
            0xc2 => IncLocalI,
            0xc3 => DecLocalI,
            0xc4 => NegateI,
            0xc5 => AddI,
            0xc6 => SubtractI,
            0xc7 => MultiplyI,
            0xd0 => GetLocal0,
            0xd1 => GetLocal1,
            0xd2 => GetLocal2,
            0xd3 => GetLocal3,
            0xd4 => SetLocal0,
            0xd5 => SetLocal1,
            0xd6 => SetLocal2,
            0xd7 => SetLocal3,
            0xef => Debug,
            0xf0 => DebugLine,
            0xf1 => DebugFile,
            _ => return None,
        };
        Some(op)
    }

    /// Inline operand layout
    pub fn layout(self) -> OperandLayout {
        use Opcode::*;
        match self {
            GetSuper | SetSuper | Dxns | Kill | PushShort | PushString | PushInt | PushUInt
            | PushDouble | PushNamespace | NewFunction | Call | Construct | ConstructSuper
            | ConstructGenericType | NewObject | NewArray | NewClass | GetDescendants
            | NewCatch | FindPropStrict | FindProperty | FindDef | GetLex | SetProperty
            | GetLocal | SetLocal | GetScopeObject | GetProperty | InitProperty
            | DeleteProperty | GetSlot | SetSlot | GetGlobalSlot | SetGlobalSlot | Coerce
            | AsType | IsType | IncLocal | DecLocal | IncLocalI | DecLocalI | DebugLine
            | DebugFile => OperandLayout::U30,

            HasNext2 | CallSuper | CallProperty | ConstructProp | CallPropLex
            | CallSuperVoid | CallPropVoid => OperandLayout::U30U30,

            PushByte => OperandLayout::I8,

            IfNlt | IfNle | IfNgt | IfNge | Jump | IfTrue | IfFalse | IfEq | IfNe | IfLt
            | IfLe | IfGt | IfGe | IfStrictEq | IfStrictNe => OperandLayout::Branch,

            LookupSwitch => OperandLayout::Switch,
            Debug => OperandLayout::Debug,
            _ => OperandLayout::None,
        }
    }

    /// Whether this is a conditional or unconditional s24 branch
    pub fn is_branch(self) -> bool {
        self.layout() == OperandLayout::Branch
    }

    /// Whether control never continues with the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::LookupSwitch
                | Opcode::Throw
                | Opcode::ReturnVoid
                | Opcode::ReturnValue
        )
    }

    /// Local index addressed by the short getlocal/setlocal forms
    pub fn short_local_index(self) -> Option<u32> {
        let byte = self as u8;
        match self {
            Opcode::GetLocal0
            | Opcode::GetLocal1
            | Opcode::GetLocal2
            | Opcode::GetLocal3
            | Opcode::SetLocal0
            | Opcode::SetLocal1
            | Opcode::SetLocal2
            | Opcode::SetLocal3 => Some(u32::from(byte & 3)),
            _ => None,
        }
    }

    /// Assembly mnemonic
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Bkpt => "bkpt",
            Nop => "nop",
            Throw => "throw",
            GetSuper => "getsuper",
            SetSuper => "setsuper",
            Dxns => "dxns",
            DxnsLate => "dxnslate",
            Kill => "kill",
            Label => "label",
            IfNlt => "ifnlt",
            IfNle => "ifnle",
            IfNgt => "ifngt",
            IfNge => "ifnge",
            Jump => "jump",
            IfTrue => "iftrue",
            IfFalse => "iffalse",
            IfEq => "ifeq",
            IfNe => "ifne",
            IfLt => "iflt",
            IfLe => "ifle",
            IfGt => "ifgt",
            IfGe => "ifge",
            IfStrictEq => "ifstricteq",
            IfStrictNe => "ifstrictne",
            LookupSwitch => "lookupswitch",
            PushWith => "pushwith",
            PopScope => "popscope",
            NextName => "nextname",
            NextValue => "nextvalue",
            HasNext2 => "hasnext2",
            PushNull => "pushnull",
            PushUndefined => "pushundefined",
            PushByte => "pushbyte",
            PushShort => "pushshort",
            PushTrue => "pushtrue",
            PushFalse => "pushfalse",
            PushNaN => "pushnan",
            Pop => "pop",
            Dup => "dup",
            Swap => "swap",
            PushString => "pushstring",
            PushInt => "pushint",
            PushUInt => "pushuint",
            PushDouble => "pushdouble",
            PushScope => "pushscope",
            PushNamespace => "pushnamespace",
            NewFunction => "newfunction",
            Call => "call",
            Construct => "construct",
            CallSuper => "callsuper",
            CallProperty => "callproperty",
            ReturnVoid => "returnvoid",
            ReturnValue => "returnvalue",
            ConstructSuper => "constructsuper",
            ConstructProp => "constructprop",
            CallPropLex => "callproplex",
            CallSuperVoid => "callsupervoid",
            CallPropVoid => "callpropvoid",
            ConstructGenericType => "constructgenerictype",
            NewObject => "newobject",
            NewArray => "newarray",
            NewActivation => "newactivation",
            NewClass => "newclass",
            GetDescendants => "getdescendants",
            NewCatch => "newcatch",
            FindPropStrict => "findpropstrict",
            FindProperty => "findproperty",
            FindDef => "finddef",
            GetLex => "getlex",
            SetProperty => "setproperty",
            GetLocal => "getlocal",
            SetLocal => "setlocal",
            GetGlobalScope => "getglobalscope",
            GetScopeObject => "getscopeobject",
            GetProperty => "getproperty",
            InitProperty => "initproperty",
            DeleteProperty => "deleteproperty",
            GetSlot => "getslot",
            SetSlot => "setslot",
            GetGlobalSlot => "getglobalslot",
            SetGlobalSlot => "setglobalslot",
            ConvertS => "convert_s",
            EscXAttr => "esc_xattr",
            ConvertI => "convert_i",
            ConvertU => "convert_u",
            ConvertD => "convert_d",
            ConvertB => "convert_b",
            ConvertO => "convert_o",
            CheckFilter => "checkfilter",
            Coerce => "coerce",
            CoerceB => "coerce_b",
            CoerceA => "coerce_a",
            CoerceI => "coerce_i",
            CoerceD => "coerce_d",
            CoerceS => "coerce_s",
            AsType => "astype",
            AsTypeLate => "astypelate",
            CoerceU => "coerce_u",
            CoerceO => "coerce_o",
            Negate => "negate",
            Increment => "increment",
            IncLocal => "inclocal",
            Decrement => "decrement",
            DecLocal => "declocal",
            TypeOf => "typeof",
            Not => "not",
            BitNot => "bitnot",
            Add => "add",
            Subtract => "subtract",
            Multiply => "multiply",
            Divide => "divide",
            Modulo => "modulo",
            LShift => "lshift",
            RShift => "rshift",
            URShift => "urshift",
            BitAnd => "bitand",
            BitOr => "bitor",
            BitXor => "bitxor",
            Equals => "equals",
            StrictEquals => "strictequals",
            LessThan => "lessthan",
            LessEquals => "lessequals",
            GreaterThan => "greaterthan",
            GreaterEquals => "greaterequals",
            InstanceOf => "instanceof",
            IsType => "istype",
            IsTypeLate => "istypelate",
            In => "in",
            IncrementI => "increment_i",
            DecrementI => "decrement_i",
            IncLocalI => "inclocal_i",
            DecLocalI => "declocal_i",
            NegateI => "negate_i",
            AddI => "add_i",
            SubtractI => "subtract_i",
            MultiplyI => "multiply_i",
            GetLocal0 => "getlocal_0",
            GetLocal1 => "getlocal_1",
            GetLocal2 => "getlocal_2",
            GetLocal3 => "getlocal_3",
            SetLocal0 => "setlocal_0",
            SetLocal1 => "setlocal_1",
            SetLocal2 => "setlocal_2",
            SetLocal3 => "setlocal_3",
            Debug => "debug",
            DebugLine => "debugline",
            DebugFile => "debugfile",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl serde::Serialize for Opcode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_matches_discriminant() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte, "{} decoded from {:#04x}", op, byte);
            }
        }
    }

    #[test]
    fn test_unknown_opcodes() {
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0x22), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn test_short_local_index() {
        assert_eq!(Opcode::GetLocal0.short_local_index(), Some(0));
        assert_eq!(Opcode::GetLocal3.short_local_index(), Some(3));
        assert_eq!(Opcode::SetLocal2.short_local_index(), Some(2));
        assert_eq!(Opcode::GetLocal.short_local_index(), None);
    }

    #[test]
    fn test_layouts() {
        assert_eq!(Opcode::IfNlt.layout(), OperandLayout::Branch);
        assert_eq!(Opcode::LookupSwitch.layout(), OperandLayout::Switch);
        assert_eq!(Opcode::CallProperty.layout(), OperandLayout::U30U30);
        assert_eq!(Opcode::PushByte.layout(), OperandLayout::I8);
        assert_eq!(Opcode::Add.layout(), OperandLayout::None);
        assert!(Opcode::Jump.is_terminator());
        assert!(!Opcode::IfTrue.is_terminator());
    }
}
