//! Jobs: the logic an atomic service runs per device.
//!
//! Atomic services name a job; the name is resolved once per step through
//! the [`JobRegistry`]. Two jobs are built in:
//!
//! - `command` renders its `command` parameter as a `{{ }}` template and sends
//!   it through the device's cached session, passing the `options`
//!   parameter along.
//! - `expression` evaluates its `expression` parameter and returns the value.
//!
//! # Example
//!
//! ```
//! use armada_runtime::error::JobError;
//! use armada_runtime::job::{Job, JobContext, JobRegistry};
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct Uptime;
//!
//! #[async_trait]
//! impl Job for Uptime {
//!     fn name(&self) -> &str {
//!         "uptime"
//!     }
//!
//!     async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError> {
//!         let session = ctx.connection().await?;
//!         Ok(session.invoke("show uptime", &Value::Null).await?)
//!     }
//! }
//!
//! let mut jobs = JobRegistry::with_builtins();
//! jobs.register(Arc::new(Uptime));
//! assert!(jobs.has("uptime") && jobs.has("command"));
//! ```

use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use armada_workflow::policy::CredentialMode;
use armada_workflow::{Device, Service};

use crate::collab::Credentials;
use crate::config::Settings;
use crate::connection::{ConnectionHandle, ConnectionKey};
use crate::error::{ConnectionError, JobError};
use crate::expression::Scope;
use crate::hooks::RunEvent;
use crate::result::RuntimeId;
use crate::runner::StepContext;

// ─────────────────────────────────────────────────────────────────────────────
// Job trait
// ─────────────────────────────────────────────────────────────────────────────

/// The logic of an atomic service.
///
/// A job runs once per device (or once per step in `once` mode) and per
/// attempt. Errors and panics become failed results; they never abort
/// sibling devices.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Name services use to reference the job.
    fn name(&self) -> &str;

    /// Runs the job and returns its raw output.
    async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError>;
}

/// Registry of jobs by name.
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: IndexMap<String, Arc<dyn Job>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in `command` and `expression`
    /// jobs.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandJob));
        registry.register(Arc::new(ExpressionJob));
        registry
    }

    /// Registers a job under its name, returning the job it replaced.
    pub fn register(&mut self, job: Arc<dyn Job>) -> Option<Arc<dyn Job>> {
        self.jobs.insert(job.name().to_owned(), job)
    }

    /// Looks a job up.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] if no job has that name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Job>, JobError> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::UnknownJob(name.to_owned()))
    }

    /// Returns true if a job has that name.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Returns the registered names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.jobs.keys().map(String::as_str).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobContext
// ─────────────────────────────────────────────────────────────────────────────

/// What a job can see and reach during one attempt.
pub struct JobContext<'a> {
    step: &'a StepContext,
    service: &'a Service,
    parameters: &'a Value,
    device: Option<&'a Device>,
    payload: &'a Value,
    settings: &'a Settings,
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("runtime", self.runtime())
            .field("path", &self.step.path)
            .field("device", &self.device.map(|d| d.name.as_str()))
            .finish_non_exhaustive()
    }
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        step: &'a StepContext,
        service: &'a Service,
        parameters: &'a Value,
        device: Option<&'a Device>,
        payload: &'a Value,
        settings: &'a Settings,
    ) -> Self {
        Self {
            step,
            service,
            parameters,
            device,
            payload,
            settings,
        }
    }

    /// Run lineage.
    #[must_use]
    pub fn runtime(&self) -> &RuntimeId {
        self.step.run.runtime()
    }

    /// The service being run.
    #[must_use]
    pub fn service(&self) -> &Service {
        self.service
    }

    /// The job parameters configured on the service.
    #[must_use]
    pub fn parameters(&self) -> &Value {
        self.parameters
    }

    /// Returns a required parameter.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::MissingParameter`] if it is absent or `null`.
    pub fn parameter(&self, name: &str) -> Result<&Value, JobError> {
        match self.parameters.get(name) {
            Some(Value::Null) | None => Err(JobError::MissingParameter(name.to_owned())),
            Some(value) => Ok(value),
        }
    }

    /// The target device, or `None` in `once` mode.
    #[must_use]
    pub fn device(&self) -> Option<&Device> {
        self.device
    }

    /// The payload after pre-processing.
    #[must_use]
    pub fn payload(&self) -> &Value {
        self.payload
    }

    /// Returns true once a stop was requested for the lineage.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.step.run.is_stopping()
    }

    /// Returns a token cancelled when a stop is requested, for long-running
    /// device calls that want to bail out early.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.step.run.cancellation()
    }

    /// Appends a line to the step's progress log.
    pub fn log(&self, line: impl Into<String>) {
        self.step
            .engine
            .progress
            .log(self.runtime(), &self.step.path, line.into());
    }

    /// Builds the expression scope: `device`, `payload`, `parameters`,
    /// `runtime` and `user`, plus `get_result` over the lineage.
    #[must_use]
    pub fn scope(&self) -> Scope<'_> {
        scope_for(self.step, self.device, self.payload).with("parameters", self.parameters.clone())
    }

    /// Renders a `{{ }}` template in [`JobContext::scope`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Expression`] on evaluation errors.
    pub fn render(&self, template: &str) -> Result<String, JobError> {
        Ok(self.step.engine.evaluator.render(template, &self.scope())?)
    }

    /// Evaluates an expression in [`JobContext::scope`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Expression`] on evaluation errors.
    pub fn evaluate(&self, expression: &str) -> Result<Value, JobError> {
        Ok(self.step.engine.evaluator.evaluate(expression, &self.scope())?)
    }

    /// Returns the lineage's session to the target device, opening one if
    /// none is cached or the cached one fails its liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::DeviceRequired`] in `once` mode, and connection
    /// errors from credential resolution or the driver.
    pub async fn connection(&self) -> Result<ConnectionHandle, JobError> {
        let device = self
            .device
            .ok_or_else(|| JobError::DeviceRequired(self.service.name.clone()))?;
        let engine = &self.step.engine;
        let key = connection_key(self.runtime(), self.service, device);
        if let Some(handle) = engine.cache.get(&key).await {
            return Ok(handle);
        }

        let driver = engine
            .drivers
            .get(&key.kind)
            .ok_or_else(|| ConnectionError::UnknownDriver(key.kind.clone()))?;
        let credentials = self.credentials(device).await?;
        let timeout = self.settings.connection_timeout;
        let handle = tokio::time::timeout(timeout, driver.open(device, &credentials, timeout))
            .await
            .map_err(|_| ConnectionError::Timeout {
                device: device.id,
                seconds: timeout.as_secs_f64(),
            })??;

        tracing::debug!(connection = %key, "opened session");
        engine.cache.put(key.clone(), Arc::clone(&handle)).await;
        engine.hooks.emit(&RunEvent::ConnectionOpened {
            runtime: key.runtime,
            device: key.device,
            kind: key.kind,
            name: key.name,
        });
        Ok(handle)
    }

    async fn credentials(&self, device: &Device) -> Result<Credentials, ConnectionError> {
        let engine = &self.step.engine;
        match &self.service.credentials {
            CredentialMode::Custom { username, secret } => {
                let scope = self.scope();
                let render = |template: &str| {
                    engine
                        .evaluator
                        .render(template, &scope)
                        .map_err(|err| ConnectionError::Credentials(err.to_string()))
                };
                Ok(Credentials::new(render(username)?, render(secret)?))
            }
            mode => {
                engine
                    .credentials
                    .credentials_for(device, self.step.run.creator(), mode)
                    .await
            }
        }
    }
}

/// Returns the cache key of a service's session to a device.
pub(crate) fn connection_key(runtime: &RuntimeId, service: &Service, device: &Device) -> ConnectionKey {
    let kind = service
        .connection
        .driver
        .clone()
        .unwrap_or_else(|| device.driver.clone());
    ConnectionKey::new(runtime.clone(), device.id, kind, service.connection.name.clone())
}

/// Builds the base expression scope of a step for a device.
pub(crate) fn scope_for<'s>(step: &'s StepContext, device: Option<&Device>, payload: &Value) -> Scope<'s> {
    let run = &step.run;
    Scope::new()
        .with("device", device.map_or(Value::Null, Device::to_value))
        .with("payload", payload.clone())
        .with("runtime", run.runtime().as_str())
        .with("user", run.creator())
        .with_results(run.as_ref())
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in jobs
// ─────────────────────────────────────────────────────────────────────────────

/// Sends a rendered command through the device session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandJob;

#[async_trait]
impl Job for CommandJob {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError> {
        let template = ctx
            .parameter("command")?
            .as_str()
            .ok_or_else(|| JobError::failed("parameter 'command' must be a string"))?;
        let command = ctx.render(template)?;
        let options = ctx.parameters().get("options").cloned().unwrap_or(Value::Null);
        let session = ctx.connection().await?;
        Ok(session.invoke(&command, &options).await?)
    }
}

/// Evaluates an expression and returns its value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionJob;

#[async_trait]
impl Job for ExpressionJob {
    fn name(&self) -> &str {
        "expression"
    }

    async fn run(&self, ctx: &JobContext<'_>) -> Result<Value, JobError> {
        let expression = ctx
            .parameter("expression")?
            .as_str()
            .ok_or_else(|| JobError::failed("parameter 'expression' must be a string"))?;
        ctx.evaluate(expression)
    }
}
