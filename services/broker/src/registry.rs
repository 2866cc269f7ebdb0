//! Named-thread registry backing the broker's liveness checks.

use crate::{BrokerError, BrokerResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::JoinHandle;

/// Every subordinate worker registers its handle here once at startup.
/// Names are unique; registering a duplicate is a configuration bug and
/// fails fast rather than silently shadowing a worker.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a named worker thread
    pub fn record(&self, name: &str, handle: JoinHandle<()>) -> BrokerResult<()> {
        let mut threads = self.threads.lock();
        if threads.contains_key(name) {
            return Err(BrokerError::DuplicateThread(name.to_string()));
        }
        threads.insert(name.to_string(), handle);
        Ok(())
    }

    /// True when every registered thread is still running
    pub fn ok(&self) -> bool {
        self.threads.lock().values().all(|h| !h.is_finished())
    }

    /// Per-thread liveness, for diagnostics
    pub fn status(&self) -> HashMap<String, bool> {
        self.threads
            .lock()
            .iter()
            .map(|(name, handle)| (name.clone(), !handle.is_finished()))
            .collect()
    }
}
