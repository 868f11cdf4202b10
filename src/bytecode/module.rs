//! JSON module format
//!
//! A module is the unit the CLI loads: a constant pool, a method table and a
//! class table. Pool tables are 1-based as in ABC files, so the first entry
//! of `strings` is string index 1.
//!
//! ```json
//! {
//!   "pool": { "strings": ["trace"], "multinames": [{ "name": "trace" }] },
//!   "methods": [{ "name": "main", "body": { "code": [208, 48, 71], "max_stack": 1, "local_count": 1 } }],
//!   "entry": "main"
//! }
//! ```

use super::method::{ClassInfo, MethodInfo};
use super::pool::{ConstantPoolData, MultinameKind};
use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::runtime::ObjectModel;
use crate::vm::VmContext;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

fn default_kind() -> MultinameKind {
    MultinameKind::QName
}

/// A multiname entry of the pool description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultinameEntry {
    #[serde(default = "default_kind")]
    pub kind: MultinameKind,
    #[serde(default)]
    pub namespace: Option<String>,
    /// `None` is the any-name
    #[serde(default)]
    pub name: Option<String>,
}

/// Constant pool tables, without the reserved index 0
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDescription {
    pub integers: Vec<i32>,
    pub uintegers: Vec<u32>,
    pub doubles: Vec<f64>,
    pub strings: Vec<String>,
    pub namespaces: Vec<String>,
    pub multinames: Vec<MultinameEntry>,
}

/// A loadable module
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub pool: PoolDescription,
    pub methods: Vec<MethodInfo>,
    #[serde(default)]
    pub classes: Vec<ClassInfo>,
    /// Name of the method `run` executes by default
    #[serde(default)]
    pub entry: Option<String>,
}

fn check_index(table: &str, position: usize, got: u32) -> Result<()> {
    let expected = position as u32 + 1;
    if got != expected {
        return Err(Error::ModuleError(format!(
            "{} entry {} duplicates index {}",
            table, expected, got
        )));
    }
    Ok(())
}

impl Module {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let module: Module =
            serde_json::from_str(json).map_err(|e| Error::ModuleError(e.to_string()))?;
        module.validate()?;
        Ok(module)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading module");
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<()> {
        let method_count = self.methods.len() as u32;
        let check_method = |what: &str, index: u32| {
            if index >= method_count {
                Err(Error::ModuleError(format!(
                    "{} refers to method {} but the module has {}",
                    what, index, method_count
                )))
            } else {
                Ok(())
            }
        };
        for class in &self.classes {
            check_method(&format!("class {} iinit", class.name), class.iinit)?;
            if let Some(cinit) = class.cinit {
                check_method(&format!("class {} cinit", class.name), cinit)?;
            }
            for m in class.methods.iter().chain(&class.static_methods) {
                check_method(&format!("{}.{}", class.name, m.name), m.method)?;
            }
        }
        if let Some(entry) = &self.entry {
            self.method_index(entry)?;
        }
        Ok(())
    }

    /// Build the in-memory pool, keeping the declared indices
    pub fn build_pool(&self) -> Result<ConstantPoolData> {
        let mut pool = ConstantPoolData::new();
        let desc = &self.pool;
        for (i, value) in desc.integers.iter().enumerate() {
            check_index("int", i, pool.add_int(*value))?;
        }
        for (i, value) in desc.uintegers.iter().enumerate() {
            check_index("uint", i, pool.add_uint(*value))?;
        }
        for (i, value) in desc.doubles.iter().enumerate() {
            check_index("double", i, pool.add_double(*value))?;
        }
        for (i, value) in desc.strings.iter().enumerate() {
            check_index("string", i, pool.add_string(value))?;
        }
        for (i, uri) in desc.namespaces.iter().enumerate() {
            check_index("namespace", i, pool.add_namespace(uri))?;
        }
        for (i, m) in desc.multinames.iter().enumerate() {
            let index = pool.add_multiname(m.kind, m.namespace.as_deref(), m.name.as_deref());
            check_index("multiname", i, index)?;
        }
        Ok(pool)
    }

    /// Index of the method called `name`
    pub fn method_index(&self, name: &str) -> Result<u32> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .map(|i| i as u32)
            .ok_or_else(|| Error::ModuleError(format!("no method named '{}'", name)))
    }

    /// The declared entry method, else `main`, else method 0
    pub fn entry_method(&self) -> Result<u32> {
        match &self.entry {
            Some(name) => self.method_index(name),
            None => match self.method_index("main") {
                Ok(index) => Ok(index),
                Err(_) if !self.methods.is_empty() => Ok(0),
                Err(e) => Err(e),
            },
        }
    }

    /// Load the module into a fresh VM
    pub fn into_vm(self, config: VmConfig, model: Rc<dyn ObjectModel>) -> Result<VmContext> {
        let pool = self.build_pool()?;
        VmContext::builder()
            .pool(Arc::new(pool))
            .methods(self.methods)
            .classes(self.classes)
            .model(model)
            .config(config)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::pool::ConstantPool;
    use std::io::Write;

    const MODULE: &str = r#"{
        "pool": {
            "integers": [100000],
            "strings": ["hello", "trace"],
            "namespaces": ["flash.utils"],
            "multinames": [
                { "name": "trace" },
                { "kind": "QName", "namespace": "flash.utils", "name": "Dictionary" },
                { "kind": "MultinameL" }
            ]
        },
        "methods": [
            { "name": "main", "body": { "code": [45, 1, 72], "max_stack": 1, "local_count": 1 } }
        ]
    }"#;

    #[test]
    fn test_pool_indices_are_one_based() {
        let module = Module::from_json_str(MODULE).unwrap();
        let pool = module.build_pool().unwrap();
        assert_eq!(pool.get_integer(1).unwrap(), 100000);
        assert_eq!(&*pool.get_string(1).unwrap(), "hello");
        assert_eq!(&*pool.get_string(2).unwrap(), "trace");
        assert_eq!(&*pool.get_namespace(1).unwrap(), "flash.utils");

        let trace = pool.get_multiname(1).unwrap().static_name().unwrap();
        assert_eq!(&*trace.name, "trace");
        let dict = pool.get_multiname(2).unwrap().static_name().unwrap();
        assert_eq!(dict.to_string(), "flash.utils::Dictionary");
        assert_eq!(pool.get_multiname(3).unwrap().kind, MultinameKind::MultinameL);
    }

    #[test]
    fn test_duplicate_constant_is_rejected() {
        let json = r#"{ "pool": { "strings": ["a", "a"] }, "methods": [] }"#;
        let module = Module::from_json_str(json).unwrap();
        assert!(matches!(module.build_pool(), Err(Error::ModuleError(_))));
    }

    #[test]
    fn test_bad_method_reference() {
        let json = r#"{
            "methods": [],
            "classes": [{ "name": "A", "iinit": 3 }]
        }"#;
        assert!(matches!(Module::from_json_str(json), Err(Error::ModuleError(_))));

        let json = r#"{ "methods": [], "entry": "missing" }"#;
        assert!(matches!(Module::from_json_str(json), Err(Error::ModuleError(_))));
    }

    #[test]
    fn test_entry_method_defaults() {
        let module = Module::from_json_str(MODULE).unwrap();
        assert_eq!(module.entry_method().unwrap(), 0);
        assert!(module.method_index("nope").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MODULE.as_bytes()).unwrap();
        let module = Module::from_file(file.path()).unwrap();
        assert_eq!(module.methods[0].body.code, vec![45, 1, 72]);
        assert!(Module::from_file("/nonexistent/module.json").is_err());
    }
}
