//! In-process exclusive sections keyed by string.
//!
//! Ingest serializes on the exact fingerprint so two workers presenting the
//! same bytes cannot both insert; group merges serialize on group ids,
//! always acquired in ascending order.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ArchiveError, Result};

#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free, up to `timeout`. Waiting out the timeout
    /// is a retryable error, never a silent proceed.
    pub fn acquire(&self, key: &str, timeout: Duration) -> Result<KeyGuard> {
        let deadline = Instant::now() + timeout;
        let mut held = self
            .inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while held.contains(key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(ArchiveError::ConcurrencyTimeout { key: key.to_string() });
            }
            let (guard, result) = self
                .inner
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            held = guard;
            if result.timed_out() && held.contains(key) {
                return Err(ArchiveError::ConcurrencyTimeout { key: key.to_string() });
            }
        }

        held.insert(key.to_string());
        Ok(KeyGuard { registry: self.inner.clone(), key: key.to_string() })
    }

    /// Acquires all keys in sorted order so concurrent multi-key holders
    /// cannot deadlock against each other.
    pub fn acquire_many(&self, keys: &[String], timeout: Duration) -> Result<Vec<KeyGuard>> {
        let mut ordered: Vec<&String> = keys.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.acquire(key, timeout)?);
        }
        Ok(guards)
    }
}

#[derive(Debug)]
pub struct KeyGuard {
    registry: Arc<Inner>,
    key: String,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.key);
        self.registry.released.notify_all();
    }
}
