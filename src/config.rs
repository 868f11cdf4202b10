//! VM configuration
//!
//! Configuration is plain data: it can be built in code, deserialized from a
//! JSON file, and adjusted through `AVM2_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// Interpreter only
    Off,
    /// Compile every method on its first invocation
    On,
    /// Compile a method once it has been invoked `jit_threshold` times
    #[default]
    Auto,
}

impl std::str::FromStr for JitMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "false" => Ok(JitMode::Off),
            "on" | "1" | "true" => Ok(JitMode::On),
            "auto" => Ok(JitMode::Auto),
            other => Err(Error::ConfigError(format!("unknown JIT mode '{}'", other))),
        }
    }
}

/// Runtime configuration for a [`VmContext`](crate::vm::VmContext)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub jit: JitMode,
    pub jit_threshold: u32,
    pub max_call_depth: usize,
    /// Log the emitted IR of every compiled method
    pub trace_jit: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            jit: JitMode::Auto,
            jit_threshold: 10,
            max_call_depth: 256,
            trace_jit: false,
        }
    }
}

impl VmConfig {
    /// Configuration that never compiles
    pub fn interpreter_only() -> Self {
        Self {
            jit: JitMode::Off,
            ..Self::default()
        }
    }

    /// Configuration that compiles every method eagerly
    pub fn jit_always() -> Self {
        Self {
            jit: JitMode::On,
            ..Self::default()
        }
    }

    /// Parse a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: VmConfig =
            serde_json::from_str(json).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply `AVM2_JIT`, `AVM2_JIT_THRESHOLD` and `AVM2_TRACE_JIT`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(mode) = lookup("AVM2_JIT") {
            self.jit = mode.parse()?;
        }
        if let Some(threshold) = lookup("AVM2_JIT_THRESHOLD") {
            self.jit_threshold = threshold.trim().parse().map_err(|_| {
                Error::ConfigError(format!("invalid AVM2_JIT_THRESHOLD '{}'", threshold))
            })?;
        }
        if let Some(flag) = lookup("AVM2_TRACE_JIT") {
            self.trace_jit = matches!(flag.trim(), "1" | "true" | "on");
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.max_call_depth == 0 {
            return Err(Error::ConfigError("max_call_depth must be at least 1".into()));
        }
        Ok(())
    }
}
