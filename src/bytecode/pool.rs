//! Constant pool access
//!
//! The execution core only consumes constants through the [`ConstantPool`]
//! trait. [`ConstantPoolData`] is the in-memory implementation used by module
//! loading, tests and benches; its strings are interned.

use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use string_interner::{DefaultStringInterner, DefaultSymbol};

/// Multiname flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultinameKind {
    /// Static namespace and name
    QName,
    /// Namespace taken from the stack
    RTQName,
    /// Namespace and name taken from the stack
    RTQNameL,
    /// Static name, namespace set
    Multiname,
    /// Name taken from the stack
    MultinameL,
    /// Parameterized type name
    TypeName,
}

impl MultinameKind {
    /// Number of operand-stack entries consumed to resolve the name
    pub fn runtime_count(self) -> usize {
        match self {
            MultinameKind::RTQName | MultinameKind::MultinameL => 1,
            MultinameKind::RTQNameL => 2,
            _ => 0,
        }
    }
}

/// A multiname as stored in the pool
#[derive(Debug, Clone, PartialEq)]
pub struct Multiname {
    pub kind: MultinameKind,
    /// `None` is the any-name `*`
    pub name: Option<Rc<str>>,
    /// `None` is the public (or any) namespace
    pub namespace: Option<Rc<str>>,
}

impl Multiname {
    /// The fully static name; fails for runtime multinames
    pub fn static_name(&self) -> Result<QualifiedName> {
        if self.kind.runtime_count() != 0 {
            return Err(Error::unsupported(format!(
                "{:?} multiname used where a static name is required",
                self.kind
            )));
        }
        Ok(QualifiedName {
            namespace: self.namespace.clone(),
            name: self.name.clone().unwrap_or_else(|| Rc::from("*")),
        })
    }
}

/// A resolved property name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub namespace: Option<Rc<str>>,
    pub name: Rc<str>,
}

impl QualifiedName {
    pub fn public(name: impl Into<Rc<str>>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => write!(f, "{}::{}", ns, self.name),
            _ => f.write_str(&self.name),
        }
    }
}

/// Read-only constant pool lookup
pub trait ConstantPool: fmt::Debug + Send + Sync {
    fn get_integer(&self, index: u32) -> Result<i32>;
    fn get_uinteger(&self, index: u32) -> Result<u32>;
    fn get_double(&self, index: u32) -> Result<f64>;
    fn get_string(&self, index: u32) -> Result<Rc<str>>;
    fn get_namespace(&self, index: u32) -> Result<Rc<str>>;
    fn get_multiname(&self, index: u32) -> Result<Multiname>;
}

fn out_of_range(what: &str, index: u32) -> Error {
    Error::format_error(format!("{} pool index {} out of range", what, index), 0)
}

#[derive(Debug, Clone, Copy)]
struct MultinameEntry {
    kind: MultinameKind,
    /// String index; 0 is the any-name
    name: u32,
    /// Namespace index; 0 is the public namespace
    namespace: u32,
}

/// In-memory constant pool
///
/// Index 0 of every table is reserved: int/uint 0, NaN, the empty string, the
/// public namespace and the any-name multiname.
#[derive(Debug, Clone)]
pub struct ConstantPoolData {
    interner: DefaultStringInterner,
    integers: Vec<i32>,
    uintegers: Vec<u32>,
    doubles: Vec<f64>,
    strings: Vec<DefaultSymbol>,
    string_index: HashMap<DefaultSymbol, u32>,
    namespaces: Vec<u32>,
    multinames: Vec<MultinameEntry>,
}

impl Default for ConstantPoolData {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPoolData {
    pub fn new() -> Self {
        let mut interner = DefaultStringInterner::default();
        let empty = interner.get_or_intern("");
        let mut string_index = HashMap::default();
        string_index.insert(empty, 0);
        Self {
            interner,
            integers: vec![0],
            uintegers: vec![0],
            doubles: vec![f64::NAN],
            strings: vec![empty],
            string_index,
            namespaces: vec![0],
            multinames: vec![MultinameEntry {
                kind: MultinameKind::QName,
                name: 0,
                namespace: 0,
            }],
        }
    }

    pub fn add_int(&mut self, value: i32) -> u32 {
        intern_value(&mut self.integers, value, |a, b| a == b)
    }

    pub fn add_uint(&mut self, value: u32) -> u32 {
        intern_value(&mut self.uintegers, value, |a, b| a == b)
    }

    pub fn add_double(&mut self, value: f64) -> u32 {
        intern_value(&mut self.doubles, value, |a, b| a.to_bits() == b.to_bits())
    }

    pub fn add_string(&mut self, value: &str) -> u32 {
        let symbol = self.interner.get_or_intern(value);
        if let Some(&index) = self.string_index.get(&symbol) {
            return index;
        }
        let index = self.strings.len() as u32;
        self.strings.push(symbol);
        self.string_index.insert(symbol, index);
        index
    }

    pub fn add_namespace(&mut self, uri: &str) -> u32 {
        let string = self.add_string(uri);
        intern_value(&mut self.namespaces, string, |a, b| a == b)
    }

    /// Public-namespace QName
    pub fn add_qname(&mut self, name: &str) -> u32 {
        self.add_multiname(MultinameKind::QName, None, Some(name))
    }

    pub fn add_multiname(
        &mut self,
        kind: MultinameKind,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> u32 {
        let entry = MultinameEntry {
            kind,
            name: name.map(|n| self.add_string(n)).unwrap_or(0),
            namespace: namespace.map(|ns| self.add_namespace(ns)).unwrap_or(0),
        };
        let existing = self.multinames.iter().position(|m| {
            m.kind == entry.kind && m.name == entry.name && m.namespace == entry.namespace
        });
        match existing {
            Some(index) if index != 0 => index as u32,
            _ => {
                self.multinames.push(entry);
                (self.multinames.len() - 1) as u32
            }
        }
    }

    fn resolve(&self, index: u32) -> Result<&str> {
        let symbol = self
            .strings
            .get(index as usize)
            .ok_or_else(|| out_of_range("string", index))?;
        self.interner
            .resolve(*symbol)
            .ok_or_else(|| Error::internal(format!("dangling interned string {}", index)))
    }
}

fn intern_value<T: Copy>(table: &mut Vec<T>, value: T, same: impl Fn(&T, &T) -> bool) -> u32 {
    if let Some(index) = table.iter().skip(1).position(|v| same(v, &value)) {
        return index as u32 + 1;
    }
    table.push(value);
    (table.len() - 1) as u32
}

impl ConstantPool for ConstantPoolData {
    fn get_integer(&self, index: u32) -> Result<i32> {
        self.integers
            .get(index as usize)
            .copied()
            .ok_or_else(|| out_of_range("int", index))
    }

    fn get_uinteger(&self, index: u32) -> Result<u32> {
        self.uintegers
            .get(index as usize)
            .copied()
            .ok_or_else(|| out_of_range("uint", index))
    }

    fn get_double(&self, index: u32) -> Result<f64> {
        self.doubles
            .get(index as usize)
            .copied()
            .ok_or_else(|| out_of_range("double", index))
    }

    fn get_string(&self, index: u32) -> Result<Rc<str>> {
        self.resolve(index).map(Rc::from)
    }

    fn get_namespace(&self, index: u32) -> Result<Rc<str>> {
        let string = self
            .namespaces
            .get(index as usize)
            .ok_or_else(|| out_of_range("namespace", index))?;
        self.get_string(*string)
    }

    fn get_multiname(&self, index: u32) -> Result<Multiname> {
        let entry = self
            .multinames
            .get(index as usize)
            .ok_or_else(|| out_of_range("multiname", index))?;
        let name = match entry.name {
            0 => None,
            n => Some(self.get_string(n)?),
        };
        let namespace = match entry.namespace {
            0 => None,
            n => Some(self.get_namespace(n)?),
        };
        Ok(Multiname {
            kind: entry.kind,
            name,
            namespace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_entries() {
        let pool = ConstantPoolData::new();
        assert_eq!(pool.get_integer(0).unwrap(), 0);
        assert!(pool.get_double(0).unwrap().is_nan());
        assert_eq!(&*pool.get_string(0).unwrap(), "");
        let any = pool.get_multiname(0).unwrap();
        assert_eq!(any.name, None);
        assert_eq!(&*any.static_name().unwrap().name, "*");
    }

    #[test]
    fn test_strings_are_deduplicated() {
        let mut pool = ConstantPoolData::new();
        let a = pool.add_string("trace");
        let b = pool.add_string("trace");
        let c = pool.add_string("Math");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*pool.get_string(c).unwrap(), "Math");
    }

    #[test]
    fn test_numeric_tables() {
        let mut pool = ConstantPoolData::new();
        let i = pool.add_int(-7);
        let u = pool.add_uint(u32::MAX);
        let d = pool.add_double(2.5);
        assert_eq!(pool.add_int(-7), i);
        assert_eq!(pool.get_integer(i).unwrap(), -7);
        assert_eq!(pool.get_uinteger(u).unwrap(), u32::MAX);
        assert_eq!(pool.get_double(d).unwrap(), 2.5);
        assert!(pool.get_integer(99).unwrap_err().is_format_error());
    }

    #[test]
    fn test_multinames() {
        let mut pool = ConstantPoolData::new();
        let q = pool.add_qname("length");
        let late = pool.add_multiname(MultinameKind::MultinameL, None, None);
        let ns = pool.add_multiname(MultinameKind::QName, Some("flash.utils"), Some("Proxy"));

        let length = pool.get_multiname(q).unwrap();
        assert_eq!(length.static_name().unwrap(), QualifiedName::public("length"));

        let late = pool.get_multiname(late).unwrap();
        assert_eq!(late.kind.runtime_count(), 1);
        assert!(late.static_name().is_err());

        let proxy = pool.get_multiname(ns).unwrap().static_name().unwrap();
        assert_eq!(proxy.to_string(), "flash.utils::Proxy");
        assert_eq!(MultinameKind::RTQNameL.runtime_count(), 2);
    }
}
