//! Registry of active run lineages.
//!
//! Every top-level run is bracketed by [`RunManager::register`] and
//! [`RunManager::unregister`]. The [`RunState`] it holds carries the
//! lineage's stop flag, its status and the index of results produced so far.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::expression::ResultLookup;
use crate::result::{RunStatus, RuntimeId, StepResult};

// ─────────────────────────────────────────────────────────────────────────────
// RunState
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state of one run lineage.
#[derive(Debug)]
pub struct RunState {
    runtime: RuntimeId,
    service: String,
    creator: String,
    parent: Option<RuntimeId>,
    cancel: CancellationToken,
    status: Mutex<RunStatus>,
    results: RwLock<HashMap<(String, Option<String>), Value>>,
    started: Instant,
}

impl RunState {
    /// Creates the state of a new lineage.
    #[must_use]
    pub fn new(
        runtime: RuntimeId,
        service: impl Into<String>,
        creator: impl Into<String>,
        parent: Option<RuntimeId>,
    ) -> Self {
        Self {
            runtime,
            service: service.into(),
            creator: creator.into(),
            parent,
            cancel: CancellationToken::new(),
            status: Mutex::new(RunStatus::Running),
            results: RwLock::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Returns the lineage identifier.
    #[must_use]
    pub fn runtime(&self) -> &RuntimeId {
        &self.runtime
    }

    /// Returns the root service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns who started the run.
    #[must_use]
    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Returns the run this one restarts.
    #[must_use]
    pub fn parent(&self) -> Option<&RuntimeId> {
        self.parent.as_ref()
    }

    /// Returns when the run started.
    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Raises the stop flag.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Returns true once a stop was requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns a token that is cancelled when a stop is requested.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: RunStatus) {
        *self.status.lock() = status;
    }

    /// Indexes a result so later steps can read it with `get_result`.
    pub fn record_result(&self, result: &StepResult) {
        let key = (result.service.clone(), result.device_name.clone());
        self.results.write().insert(key, result.to_value());
    }
}

impl ResultLookup for RunState {
    fn result(&self, service: &str, device: Option<&str>) -> Option<Value> {
        self.results
            .read()
            .get(&(service.to_owned(), device.map(str::to_owned)))
            .cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RunManager
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of every active lineage's [`RunState`].
///
/// Also remembers the most recently finished lineages, up to `retention`,
/// so their transient data can be dropped once they age out.
#[derive(Debug)]
pub struct RunManager {
    runs: RwLock<HashMap<RuntimeId, Arc<RunState>>>,
    finished: Mutex<VecDeque<RuntimeId>>,
    retention: usize,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RunManager {
    /// Creates an empty manager keeping 256 finished lineages.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(256)
    }

    /// Creates an empty manager keeping `retention` finished lineages.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
        }
    }

    /// Registers a lineage and returns its shared state.
    pub fn register(&self, state: RunState) -> Arc<RunState> {
        let state = Arc::new(state);
        self.runs
            .write()
            .insert(state.runtime.clone(), Arc::clone(&state));
        state
    }

    /// Removes a lineage.
    pub fn unregister(&self, runtime: &RuntimeId) -> Option<Arc<RunState>> {
        self.runs.write().remove(runtime)
    }

    /// Unregisters a finished lineage and returns the lineages that fell out
    /// of the retention window, oldest first.
    pub fn retire(&self, runtime: &RuntimeId) -> Vec<RuntimeId> {
        self.unregister(runtime);
        let mut finished = self.finished.lock();
        finished.push_back(runtime.clone());
        let excess = finished.len().saturating_sub(self.retention);
        finished.drain(..excess).collect()
    }

    /// Returns the state of an active lineage.
    #[must_use]
    pub fn get(&self, runtime: &RuntimeId) -> Option<Arc<RunState>> {
        self.runs.read().get(runtime).cloned()
    }

    /// Requests a stop. Returns false if the lineage is not active.
    pub fn request_stop(&self, runtime: &RuntimeId) -> bool {
        match self.get(runtime) {
            Some(state) => {
                state.request_stop();
                true
            }
            None => false,
        }
    }

    /// Returns the active lineages.
    #[must_use]
    pub fn active(&self) -> Vec<RuntimeId> {
        self.runs.read().keys().cloned().collect()
    }
}
