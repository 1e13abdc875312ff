//! The engine: entry points for starting, observing and stopping runs.
//!
//! An [`Engine`] owns every collaborator a run needs and hands a shared
//! reference to each step. Top-level runs are bracketed by the
//! [`RunManager`]: registered when they start, finalized and unregistered
//! when they end, whatever the outcome.
//!
//! # Lifecycle of a top-level run
//!
//! 1. **Register** the lineage and record it as `Running`
//! 2. **Run** the root step through the runner
//! 3. **Finalize**: record the terminal status, close every cached
//!    connection of the lineage, send the notification, unregister
//!
//! ```no_run
//! use std::sync::Arc;
//! use armada_runtime::engine::{Engine, RunRequest};
//! use armada_workflow::Service;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder().build()?;
//! let service = Arc::new(
//!     Service::atomic(1, "hello", "expression")
//!         .with_parameters(json!({"expression": "'hello ' + payload.name"})),
//! );
//! let report = engine
//!     .run(service, RunRequest::new("admin").with_payload(json!({"name": "fleet"})))
//!     .await?;
//! assert!(report.success);
//! # Ok(())
//! # }
//! ```

use core::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use armada_workflow::policy::TargetConfig;
use armada_workflow::{Device, DeviceId, MemberId, Service};

use crate::collab::{
    Authorization, CredentialResolver, MemoryPersistence, Persistence, RunRecord,
    StaticAuthorization, StaticCredentials,
};
use crate::config::{EngineConfig, RunOverrides};
use crate::connection::{ConnectionCache, ConnectionDriver, DriverRegistry};
use crate::error::{ConfigError, RunError};
use crate::expression::Evaluator;
use crate::hooks::{RunEvent, RunHooks};
use crate::job::{Job, JobRegistry, scope_for};
use crate::manager::{RunManager, RunState};
use crate::notify::{self, LogNotifier, Notifier, NotifierRegistry};
use crate::progress::{MemoryProgressStore, ProgressRecord, ProgressStore, fields};
use crate::result::{RunReport, RunResult, RunStatus, RuntimeId, StepResult};
use crate::runner::{Runner, StepContext};
use crate::targets::TargetResolver;

// ─────────────────────────────────────────────────────────────────────────────
// Engine internals
// ─────────────────────────────────────────────────────────────────────────────

/// Collaborators shared by every step of every run.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) evaluator: Evaluator,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) authorization: Arc<dyn Authorization>,
    pub(crate) credentials: Arc<dyn CredentialResolver>,
    pub(crate) drivers: DriverRegistry,
    pub(crate) jobs: JobRegistry,
    pub(crate) notifiers: NotifierRegistry,
    pub(crate) progress: Arc<dyn ProgressStore>,
    pub(crate) cache: ConnectionCache,
    pub(crate) hooks: Arc<RunHooks>,
    pub(crate) manager: RunManager,
}

// ─────────────────────────────────────────────────────────────────────────────
// RunRequest
// ─────────────────────────────────────────────────────────────────────────────

/// What to run a service with.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// User starting the run; drives authorization and credentials.
    pub creator: String,
    /// Explicit devices, replacing the service's own target sources.
    pub targets: Option<Vec<DeviceId>>,
    /// Initial payload.
    pub payload: Value,
    /// Run this one restarts. Devices that already succeeded there are
    /// recovered instead of re-run.
    pub parent_runtime: Option<RuntimeId>,
    /// Run-local setting overrides for the root step.
    pub overrides: Option<RunOverrides>,
    /// Workflow members to start from instead of *Start*.
    pub start_members: Vec<MemberId>,
}

impl RunRequest {
    /// Creates a request on behalf of `creator`.
    #[must_use]
    pub fn new(creator: impl Into<String>) -> Self {
        Self {
            creator: creator.into(),
            ..Self::default()
        }
    }

    /// Runs against exactly these devices.
    #[must_use]
    pub fn with_targets(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.targets = Some(devices.into_iter().collect());
        self
    }

    /// Sets the initial payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Restarts `parent`.
    #[must_use]
    pub fn with_parent(mut self, parent: RuntimeId) -> Self {
        self.parent_runtime = Some(parent);
        self
    }

    /// Overrides settings of the root step.
    #[must_use]
    pub fn with_overrides(mut self, overrides: RunOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Starts a workflow from the given members.
    #[must_use]
    pub fn with_start_members(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.start_members = members.into_iter().collect();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

type RunTask = JoinHandle<Result<RunReport, RunError>>;

/// The run execution engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    tasks: Arc<Mutex<HashMap<RuntimeId, RunTask>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("jobs", &self.inner.jobs)
            .field("drivers", &self.inner.drivers)
            .field("notifiers", &self.inner.notifiers)
            .field("active", &self.inner.manager.active())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Returns a builder with in-memory collaborators.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Runs `service` to completion.
    ///
    /// Step failures are reported in the returned [`RunReport`].
    ///
    /// # Errors
    ///
    /// Only [`RunError::ResourceExhausted`] is returned as an error.
    pub async fn run(&self, service: Arc<Service>, request: RunRequest) -> Result<RunReport, RunError> {
        let state = self.register(&service, &request);
        self.drive(state, service, request).await
    }

    /// Starts `service` in the background and returns its runtime id.
    ///
    /// The lineage is registered before this returns, so it can be stopped
    /// right away. Must be called from within a Tokio runtime.
    pub fn start_run(&self, service: Arc<Service>, request: RunRequest) -> RuntimeId {
        let state = self.register(&service, &request);
        let runtime = state.runtime().clone();
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.drive(state, service, request).await });
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.inner.config.finished_run_retention {
            tasks.retain(|_, task| !task.is_finished());
        }
        tasks.insert(runtime.clone(), task);
        runtime
    }

    /// Waits for a run started with [`Engine::start_run`]. Returns `None` for
    /// unknown runs, runs already waited for, and finished runs whose handle
    /// was dropped once more than `finished_run_retention` handles piled up.
    pub async fn wait(&self, runtime: &RuntimeId) -> Option<Result<RunReport, RunError>> {
        let task = self.tasks.lock().remove(runtime)?;
        Some(match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(%runtime, error = %err, "run task failed");
                Err(RunError::Aborted)
            }
        })
    }

    /// Returns a snapshot of a run's progress.
    #[must_use]
    pub fn get_progress(&self, runtime: &RuntimeId) -> Option<ProgressRecord> {
        self.inner.progress.snapshot(runtime)
    }

    /// Requests a cooperative stop. Returns false if the run is not active.
    pub fn request_stop(&self, runtime: &RuntimeId) -> bool {
        let stopping = self.inner.manager.request_stop(runtime);
        if stopping {
            tracing::info!(%runtime, "stop requested");
        }
        stopping
    }

    /// Returns the stored top-level result of a run, for one device or, with
    /// `None`, the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Persistence`] if the store cannot be read.
    pub async fn get_result(
        &self,
        runtime: &RuntimeId,
        device: Option<DeviceId>,
    ) -> Result<Option<StepResult>, RunError> {
        let persistence = &self.inner.persistence;
        let Some(run) = persistence.run(runtime).await? else {
            return Ok(None);
        };
        Ok(persistence
            .results(runtime)
            .await?
            .into_iter()
            .rev()
            .find(|record| record.path == run.service && record.result.device == device)
            .map(|record| record.result))
    }

    /// Returns the lifecycle hooks registry.
    #[must_use]
    pub fn hooks(&self) -> &RunHooks {
        &self.inner.hooks
    }

    /// Returns the connection cache.
    #[must_use]
    pub fn connections(&self) -> &ConnectionCache {
        &self.inner.cache
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the runtime ids of active runs.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RuntimeId> {
        self.inner.manager.active()
    }

    fn register(&self, service: &Service, request: &RunRequest) -> Arc<RunState> {
        self.inner.manager.register(RunState::new(
            RuntimeId::new(),
            service.name.clone(),
            request.creator.clone(),
            request.parent_runtime.clone(),
        ))
    }

    async fn drive(
        &self,
        state: Arc<RunState>,
        service: Arc<Service>,
        request: RunRequest,
    ) -> Result<RunReport, RunError> {
        let runtime = state.runtime().clone();
        let span = tracing::info_span!("run", %runtime, service = %service.name);
        async move {
            let inner = &self.inner;
            tracing::info!(creator = %request.creator, "run started");
            inner.hooks.emit(&RunEvent::RunStart {
                runtime: runtime.clone(),
                service: service.name.clone(),
            });
            self.record_run(&state, None).await;

            let RunRequest {
                targets,
                payload,
                overrides,
                start_members,
                ..
            } = request;
            let ctx = StepContext::root(Arc::clone(inner), Arc::clone(&state), overrides, start_members);
            let outcome = match self.explicit_targets(&ctx, targets, &payload).await {
                Ok(devices) => {
                    let runner = Runner::new(&ctx, &service);
                    runner.run(devices.as_deref(), &payload).await
                }
                Err(err) => {
                    tracing::warn!(error = %err, "explicit targets rejected");
                    Ok(RunResult::failed(runtime.clone(), &service.name, &ctx.path, err))
                }
            };
            self.finalize(&state, &service, &ctx, outcome).await
        }
        .instrument(span)
        .await
    }

    async fn explicit_targets(
        &self,
        ctx: &StepContext,
        targets: Option<Vec<DeviceId>>,
        payload: &Value,
    ) -> Result<Option<Vec<Device>>, RunError> {
        let Some(devices) = targets else {
            return Ok(None);
        };
        let inner = &self.inner;
        let config = TargetConfig {
            devices,
            ..TargetConfig::default()
        };
        let scope = scope_for(ctx, None, payload);
        let resolver = TargetResolver::new(
            inner.persistence.as_ref(),
            inner.authorization.as_ref(),
            &inner.evaluator,
        );
        Ok(Some(resolver.resolve(&config, ctx.run.creator(), &scope).await?))
    }

    /// Records the terminal status, releases the lineage's connections and
    /// sends the notification. Runs whatever the outcome.
    async fn finalize(
        &self,
        state: &RunState,
        service: &Service,
        ctx: &StepContext,
        outcome: Result<RunResult, RunError>,
    ) -> Result<RunReport, RunError> {
        let inner = &self.inner;
        let runtime = state.runtime().clone();
        let status = if state.is_stopping() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        state.set_status(status);
        let success = outcome.as_ref().is_ok_and(|result| result.success);
        self.record_run(state, Some(success)).await;

        let closed = inner.cache.close_all(&runtime).await;
        tracing::debug!(closed, "released connections");
        ctx.set(fields::STATUS, Value::from(status.to_string()));

        let outcome = outcome.map(|result| RunReport {
            runtime: runtime.clone(),
            status,
            success,
            result,
        });
        if let Ok(report) = &outcome {
            notify::dispatch(&inner.notifiers, service, report).await;
        }

        let duration = state.started().elapsed();
        tracing::info!(%status, success, ?duration, "run finished");
        inner.hooks.emit(&RunEvent::RunComplete {
            runtime: runtime.clone(),
            status,
            success,
            duration,
        });
        for expired in inner.manager.retire(&runtime) {
            inner.progress.clear(&expired);
        }
        outcome
    }

    async fn record_run(&self, state: &RunState, success: Option<bool>) {
        let persistence = &self.inner.persistence;
        let record = RunRecord {
            runtime: state.runtime().clone(),
            service: state.service().to_owned(),
            creator: state.creator().to_owned(),
            parent: state.parent().cloned(),
            status: state.status(),
            success,
        };
        let saved = match persistence.save_run(record).await {
            Ok(()) => persistence.commit().await,
            Err(err) => Err(err),
        };
        if let Err(err) = saved {
            tracing::error!(error = %err, "failed to record run");
            if let Err(rollback) = persistence.rollback().await {
                tracing::error!(error = %rollback, "rollback failed");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EngineBuilder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Engine`].
///
/// Collaborators that are not provided default to the in-memory ones:
/// [`MemoryPersistence`], [`StaticAuthorization::allow_all`],
/// an empty [`StaticCredentials`] and a [`MemoryProgressStore`]. The job
/// registry starts with the built-in jobs and the notifier registry with
/// [`LogNotifier`].
pub struct EngineBuilder {
    config: EngineConfig,
    persistence: Option<Arc<dyn Persistence>>,
    authorization: Option<Arc<dyn Authorization>>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    progress: Option<Arc<dyn ProgressStore>>,
    drivers: DriverRegistry,
    jobs: JobRegistry,
    notifiers: NotifierRegistry,
    hooks: RunHooks,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("jobs", &self.jobs)
            .field("drivers", &self.drivers)
            .field("notifiers", &self.notifiers)
            .finish_non_exhaustive()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Creates a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        let mut notifiers = NotifierRegistry::new();
        notifiers.register(Arc::new(LogNotifier));
        Self {
            config: EngineConfig::default(),
            persistence: None,
            authorization: None,
            credentials: None,
            progress: None,
            drivers: DriverRegistry::new(),
            jobs: JobRegistry::with_builtins(),
            notifiers,
            hooks: RunHooks::new(),
        }
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the persistence collaborator.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Sets the authorization collaborator.
    #[must_use]
    pub fn with_authorization(mut self, authorization: Arc<dyn Authorization>) -> Self {
        self.authorization = Some(authorization);
        self
    }

    /// Sets the credential resolver.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the progress store.
    #[must_use]
    pub fn with_progress_store(mut self, progress: Arc<dyn ProgressStore>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Registers a connection driver.
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn ConnectionDriver>) -> Self {
        self.drivers.register(driver);
        self
    }

    /// Registers a job.
    #[must_use]
    pub fn with_job(mut self, job: Arc<dyn Job>) -> Self {
        self.jobs.register(job);
        self
    }

    /// Registers a notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.register(notifier);
        self
    }

    /// Uses a pre-populated hooks registry.
    #[must_use]
    pub fn with_hooks(mut self, hooks: RunHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is out of range.
    pub fn build(self) -> Result<Engine, ConfigError> {
        let config = self.config;
        config.validate()?;
        let hooks = Arc::new(self.hooks);
        let inner = EngineInner {
            evaluator: Evaluator::new(config.expression_depth_limit),
            persistence: self
                .persistence
                .unwrap_or_else(|| Arc::new(MemoryPersistence::new())),
            authorization: self
                .authorization
                .unwrap_or_else(|| Arc::new(StaticAuthorization::allow_all())),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(StaticCredentials::new())),
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(MemoryProgressStore::new(config.progress_log_limit))),
            drivers: self.drivers,
            jobs: self.jobs,
            notifiers: self.notifiers,
            cache: ConnectionCache::new(config.close_concurrency).with_hooks(Arc::clone(&hooks)),
            hooks,
            manager: RunManager::with_retention(config.finished_run_retention),
            config,
        };
        Ok(Engine {
            inner: Arc::new(inner),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}
