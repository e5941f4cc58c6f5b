//! In-process shared counter backend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DistributedStorage, StorageError};

/// A [`DistributedStorage`] backed by an in-process map.
///
/// Clones share the same counters, so several registries in one process
/// can coordinate through it exactly as they would through an external
/// store. It doubles as the reference semantics a network backend must
/// match: `try_acquire` initializes an absent counter to `max_tokens`
/// and decrements while positive, `release` adds, `reset` overwrites.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    counters: Arc<Mutex<HashMap<String, i64>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, if it has been seen.
    pub fn count(&self, key: &str) -> Option<i64> {
        self.counters.lock().get(key).copied()
    }
}

impl DistributedStorage for MemoryStorage {
    fn try_acquire(&self, key: &str, max_tokens: i64) -> Result<bool, StorageError> {
        let mut counters = self.counters.lock();
        let count = counters.entry(key.to_string()).or_insert(max_tokens);
        if *count > 0 {
            *count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn release(&self, key: &str, tokens: i64) -> Result<(), StorageError> {
        let mut counters = self.counters.lock();
        *counters.entry(key.to_string()).or_insert(0) += tokens;
        Ok(())
    }

    fn reset(&self, key: &str, max_tokens: i64) -> Result<(), StorageError> {
        self.counters.lock().insert(key.to_string(), max_tokens);
        Ok(())
    }
}
