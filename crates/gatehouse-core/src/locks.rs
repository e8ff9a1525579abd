//! Per-run command locks and the registry of executor calls in flight.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Held for the duration of a command's work on one run.
pub type RunGuard = OwnedMutexGuard<()>;

/// Async mutexes keyed by run id (or any other key).
///
/// Entries nobody holds or waits on are dropped on the next acquire, so the
/// map stays as small as the set of contended keys.
#[derive(Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<String, KeyLock>>,
}

impl RunLocks {
    pub async fn acquire(&self, key: &str) -> RunGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Executions whose executor is running without the run lock held.
#[derive(Default)]
pub struct InFlight {
    /// Execution id to run id.
    calls: Mutex<HashMap<String, String>>,
}

impl InFlight {
    /// Register a call; it is removed when the returned guard drops.
    pub fn enter(&self, execution_id: &str, run_id: &str) -> InFlightCall<'_> {
        self.calls
            .lock()
            .insert(execution_id.to_string(), run_id.to_string());
        InFlightCall {
            registry: self,
            execution_id: execution_id.to_string(),
        }
    }

    pub fn has_execution(&self, execution_id: &str) -> bool {
        self.calls.lock().contains_key(execution_id)
    }

    /// The first in-flight execution belonging to any of `run_ids`.
    pub fn running_in<'a>(&self, run_ids: impl IntoIterator<Item = &'a str>) -> Option<String> {
        let calls = self.calls.lock();
        run_ids.into_iter().find_map(|run_id| {
            calls
                .iter()
                .find(|(_, owner)| owner.as_str() == run_id)
                .map(|(execution_id, _)| execution_id.clone())
        })
    }
}

pub struct InFlightCall<'a> {
    registry: &'a InFlight,
    execution_id: String,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.registry.calls.lock().remove(&self.execution_id);
    }
}
