//! Live progress tracking.
//!
//! Progress is keyed by `<runtime>/<step path>/<field>`. Counters are atomic
//! so parallel workers can bump them without coordination; each critical
//! section only covers a single map lookup.

use core::sync::atomic::{AtomicI64, Ordering};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::RuntimeId;

/// Progress field names written by the engine.
pub mod fields {
    /// Number of targets of the step.
    pub const TOTAL: &str = "total";
    /// Devices that succeeded.
    pub const SUCCESS: &str = "success";
    /// Devices that failed.
    pub const FAILURE: &str = "failure";
    /// Devices skipped or discarded.
    pub const SKIPPED: &str = "skipped";
    /// Devices aborted.
    pub const ABORTED: &str = "aborted";
    /// Step or run status.
    pub const STATUS: &str = "status";
    /// Prefix of per-edge traversal counters.
    pub const EDGE_PREFIX: &str = "edge:";
}

/// Read-only snapshot of one lineage's progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Run lineage.
    pub runtime: RuntimeId,
    /// Counters, keyed by `<step path>/<field>`.
    pub counters: BTreeMap<String, i64>,
    /// State values, keyed by `<step path>/<field>`.
    pub values: BTreeMap<String, Value>,
    /// Log lines per step path.
    pub logs: BTreeMap<String, Vec<String>>,
}

impl ProgressRecord {
    /// Returns a counter, or 0.
    #[must_use]
    pub fn counter(&self, path: &str, field: &str) -> i64 {
        self.counters
            .get(&key(path, field))
            .copied()
            .unwrap_or_default()
    }

    /// Returns a state value.
    #[must_use]
    pub fn value(&self, path: &str, field: &str) -> Option<&Value> {
        self.values.get(&key(path, field))
    }

    /// Returns the log lines of a step.
    #[must_use]
    pub fn logs(&self, path: &str) -> &[String] {
        self.logs.get(path).map_or(&[], Vec::as_slice)
    }
}

fn key(path: &str, field: &str) -> String {
    format!("{path}/{field}")
}

/// Transient store of per-lineage progress.
pub trait ProgressStore: Send + Sync + 'static {
    /// Adds `delta` to a counter.
    fn increment(&self, runtime: &RuntimeId, path: &str, field: &str, delta: i64);

    /// Sets a state value.
    fn set(&self, runtime: &RuntimeId, path: &str, field: &str, value: Value);

    /// Appends a log line to a step.
    fn log(&self, runtime: &RuntimeId, path: &str, line: String);

    /// Returns a snapshot of a lineage.
    fn snapshot(&self, runtime: &RuntimeId) -> Option<ProgressRecord>;

    /// Drops everything recorded for a lineage.
    fn clear(&self, runtime: &RuntimeId);
}

#[derive(Debug, Default)]
struct LineageProgress {
    counters: RwLock<HashMap<String, Arc<AtomicI64>>>,
    values: Mutex<HashMap<String, Value>>,
    logs: Mutex<HashMap<String, VecDeque<String>>>,
}

impl LineageProgress {
    fn counter(&self, key: String) -> Arc<AtomicI64> {
        if let Some(counter) = self.counters.read().get(&key) {
            return Arc::clone(counter);
        }
        Arc::clone(self.counters.write().entry(key).or_default())
    }
}

/// In-memory [`ProgressStore`].
#[derive(Debug)]
pub struct MemoryProgressStore {
    lineages: RwLock<HashMap<RuntimeId, Arc<LineageProgress>>>,
    log_limit: usize,
}

impl Default for MemoryProgressStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryProgressStore {
    /// Creates a store keeping at most `log_limit` lines per step.
    #[must_use]
    pub fn new(log_limit: usize) -> Self {
        Self {
            lineages: RwLock::new(HashMap::new()),
            log_limit: log_limit.max(1),
        }
    }

    fn lineage(&self, runtime: &RuntimeId) -> Arc<LineageProgress> {
        if let Some(lineage) = self.lineages.read().get(runtime) {
            return Arc::clone(lineage);
        }
        Arc::clone(self.lineages.write().entry(runtime.clone()).or_default())
    }
}

impl ProgressStore for MemoryProgressStore {
    fn increment(&self, runtime: &RuntimeId, path: &str, field: &str, delta: i64) {
        self.lineage(runtime)
            .counter(key(path, field))
            .fetch_add(delta, Ordering::Relaxed);
    }

    fn set(&self, runtime: &RuntimeId, path: &str, field: &str, value: Value) {
        self.lineage(runtime)
            .values
            .lock()
            .insert(key(path, field), value);
    }

    fn log(&self, runtime: &RuntimeId, path: &str, line: String) {
        let lineage = self.lineage(runtime);
        let mut logs = lineage.logs.lock();
        let lines = logs.entry(path.to_owned()).or_default();
        if lines.len() == self.log_limit {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self, runtime: &RuntimeId) -> Option<ProgressRecord> {
        let lineage = Arc::clone(self.lineages.read().get(runtime)?);
        let counters = lineage
            .counters
            .read()
            .iter()
            .map(|(key, counter)| (key.clone(), counter.load(Ordering::Relaxed)))
            .collect();
        let values = lineage
            .values
            .lock()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let logs = lineage
            .logs
            .lock()
            .iter()
            .map(|(path, lines)| (path.clone(), lines.iter().cloned().collect()))
            .collect();
        Some(ProgressRecord {
            runtime: runtime.clone(),
            counters,
            values,
            logs,
        })
    }

    fn clear(&self, runtime: &RuntimeId) {
        self.lineages.write().remove(runtime);
    }
}
