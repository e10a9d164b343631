//! Per-path mutual exclusion.
//!
//! Operations on the same canonical path are serialized through an async
//! mutex handed out by the [`LockRegistry`]. Different paths never contend.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::sandbox::CanonicalPath;

static GLOBAL: OnceLock<Arc<LockRegistry>> = OnceLock::new();

/// Registry of one async mutex per canonical path.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<LockRegistry> {
        GLOBAL.get_or_init(|| Arc::new(LockRegistry::new())).clone()
    }

    /// Get the lock for `path`, creating it on first use.
    ///
    /// Concurrent callers for the same path always receive the same handle.
    pub fn lock_for(&self, path: &CanonicalPath) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.key())
            .or_insert_with(|| {
                debug!(path = %path, "Created path lock");
                Arc::new(Mutex::new(()))
            })
            .clone()
    }

    /// Drop locks that nobody outside the registry holds.
    ///
    /// Returns the number of entries removed.
    pub fn evict_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!(removed, "Evicted idle path locks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
