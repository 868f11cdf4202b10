//! Shared cache of compiled methods
//!
//! A `CodeCache` can be shared between VMs on different threads through an
//! `Arc`. Each method gets one slot; the first compilation that finishes is
//! published into it and every later reader gets the same
//! `Arc<CompiledMethod>`. Compilation runs outside the map lock, so two
//! threads racing on a cold method may both compile, but only one result is
//! ever published.

use super::CompiledMethod;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    compiled: OnceLock<Arc<CompiledMethod>>,
    /// Set when compilation failed; the method stays interpreted
    failed: OnceLock<String>,
}

/// Thread-safe compiled-code cache keyed by method index
#[derive(Debug, Default)]
pub struct CodeCache {
    slots: RwLock<HashMap<u32, Arc<Slot>>>,
    attempts: AtomicUsize,
    published: AtomicUsize,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: u32) -> Arc<Slot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key).or_default())
    }

    /// Published code for `key`, if any
    pub fn get(&self, key: u32) -> Option<Arc<CompiledMethod>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .and_then(|slot| slot.compiled.get().cloned())
    }

    /// Whether compiling `key` failed before
    pub fn has_failed(&self, key: u32) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .is_some_and(|slot| slot.failed.get().is_some())
    }

    /// Published code for `key`, compiling it with `compile` if needed
    pub fn get_or_compile<F>(&self, key: u32, compile: F) -> Result<Arc<CompiledMethod>>
    where
        F: FnOnce() -> Result<CompiledMethod>,
    {
        let slot = self.slot(key);
        if let Some(compiled) = slot.compiled.get() {
            return Ok(Arc::clone(compiled));
        }
        if let Some(reason) = slot.failed.get() {
            return Err(Error::unsupported(format!(
                "method {} is not compilable: {}",
                key, reason
            )));
        }

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let compiled = match compile() {
            Ok(compiled) => Arc::new(compiled),
            Err(err) => {
                if slot.failed.set(err.to_string()).is_err() {
                    debug!(method = key, "compile failure already recorded by another thread");
                }
                return Err(err);
            }
        };

        let mut won = false;
        let published = slot.compiled.get_or_init(|| {
            won = true;
            compiled
        });
        if won {
            self.published.fetch_add(1, Ordering::Relaxed);
            debug!(method = key, "published compiled code");
        }
        Ok(Arc::clone(published))
    }

    /// Number of compilations started
    pub fn compile_attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Number of compiled methods published
    pub fn publish_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of methods with a slot
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
