//! Services: named, versioned units of work.
//!
//! A [`Service`] is either atomic (it names a job resolved by the runtime's job
//! registry) or a workflow (a graph of member services). Both kinds share the
//! same policy surface.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::{
    ConnectionPolicy, ConversionMethod, CredentialMode, NotificationPolicy, PostprocessingMode,
    RetryPolicy, RunMode, SkipPolicy, TargetConfig, ValidationPolicy,
};
use crate::workflow::Workflow;

/// Unique identifier for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl ServiceId {
    /// Creates a new service ID.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service_{}", self.0)
    }
}

/// What a service does when it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceKind {
    /// Invokes a registered job per device (or once).
    Atomic {
        /// Job name in the runtime's job registry.
        job: String,
        /// Job parameters, passed through untouched.
        #[serde(default)]
        parameters: Value,
    },
    /// Traverses a graph of member services.
    Workflow(Workflow),
}

/// A configured, reusable unit of automation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Unique identifier.
    pub id: ServiceId,
    /// Unique name.
    pub name: String,
    /// Definition version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Atomic or workflow.
    pub kind: ServiceKind,
    /// Target sources.
    #[serde(default)]
    pub targets: TargetConfig,
    /// Dispatch mode.
    #[serde(default)]
    pub run_mode: RunMode,
    /// Worker pool ceiling for parallel dispatch; `None` uses the engine default.
    #[serde(default)]
    pub max_processes: Option<usize>,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Output conversion.
    #[serde(default)]
    pub conversion: ConversionMethod,
    /// Validation policy.
    #[serde(default)]
    pub validation: Option<ValidationPolicy>,
    /// Statements run against the payload before the job.
    #[serde(default)]
    pub preprocessing: Option<String>,
    /// Statements run against the result after the job.
    #[serde(default)]
    pub postprocessing: Option<String>,
    /// When post-processing runs.
    #[serde(default)]
    pub postprocessing_mode: PostprocessingMode,
    /// Skip policy.
    #[serde(default)]
    pub skip: SkipPolicy,
    /// Connection reuse policy.
    #[serde(default)]
    pub connection: ConnectionPolicy,
    /// Credential source.
    #[serde(default)]
    pub credentials: CredentialMode,
    /// Notification policy.
    #[serde(default)]
    pub notification: NotificationPolicy,
    /// Priority used by the workflow traversal queue. Higher runs first.
    #[serde(default)]
    pub priority: i32,
}

fn default_version() -> u32 {
    1
}

impl Service {
    /// Creates a service with default policies.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            id: ServiceId(id),
            name: name.into(),
            version: default_version(),
            kind,
            targets: TargetConfig::default(),
            run_mode: RunMode::default(),
            max_processes: None,
            retry: RetryPolicy::default(),
            conversion: ConversionMethod::default(),
            validation: None,
            preprocessing: None,
            postprocessing: None,
            postprocessing_mode: PostprocessingMode::default(),
            skip: SkipPolicy::default(),
            connection: ConnectionPolicy::default(),
            credentials: CredentialMode::default(),
            notification: NotificationPolicy::default(),
            priority: 0,
        }
    }

    /// Creates an atomic service invoking `job` with no parameters.
    #[must_use]
    pub fn atomic(id: u64, name: impl Into<String>, job: impl Into<String>) -> Self {
        Self::new(
            id,
            name,
            ServiceKind::Atomic {
                job: job.into(),
                parameters: Value::Null,
            },
        )
    }

    /// Creates a workflow service.
    #[must_use]
    pub fn workflow(id: u64, name: impl Into<String>, workflow: Workflow) -> Self {
        Self::new(id, name, ServiceKind::Workflow(workflow))
    }

    /// Returns true if this service is a workflow.
    #[must_use]
    pub fn is_workflow(&self) -> bool {
        matches!(self.kind, ServiceKind::Workflow(_))
    }

    /// Returns the workflow graph, if this service is a workflow.
    #[must_use]
    pub fn as_workflow(&self) -> Option<&Workflow> {
        match &self.kind {
            ServiceKind::Workflow(workflow) => Some(workflow),
            ServiceKind::Atomic { .. } => None,
        }
    }

    /// Sets the job parameters of an atomic service. No effect on workflows.
    #[must_use]
    pub fn with_parameters(mut self, value: Value) -> Self {
        if let ServiceKind::Atomic { parameters, .. } = &mut self.kind {
            *parameters = value;
        }
        self
    }

    /// Sets the target sources.
    #[must_use]
    pub fn with_targets(mut self, targets: TargetConfig) -> Self {
        self.targets = targets;
        self
    }

    /// Sets the dispatch mode.
    #[must_use]
    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.run_mode = mode;
        self
    }

    /// Sets the worker pool ceiling.
    #[must_use]
    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = Some(max);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the output conversion.
    #[must_use]
    pub fn with_conversion(mut self, conversion: ConversionMethod) -> Self {
        self.conversion = conversion;
        self
    }

    /// Sets the validation policy.
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationPolicy) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Sets the pre-processing statements.
    #[must_use]
    pub fn with_preprocessing(mut self, statements: impl Into<String>) -> Self {
        self.preprocessing = Some(statements.into());
        self
    }

    /// Sets the post-processing statements and when they run.
    #[must_use]
    pub fn with_postprocessing(
        mut self,
        statements: impl Into<String>,
        mode: PostprocessingMode,
    ) -> Self {
        self.postprocessing = Some(statements.into());
        self.postprocessing_mode = mode;
        self
    }

    /// Sets the skip policy.
    #[must_use]
    pub fn with_skip(mut self, skip: SkipPolicy) -> Self {
        self.skip = skip;
        self
    }

    /// Sets the connection policy.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionPolicy) -> Self {
        self.connection = connection;
        self
    }

    /// Sets the credential source.
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the notification policy.
    #[must_use]
    pub fn with_notification(mut self, notification: NotificationPolicy) -> Self {
        self.notification = notification;
        self
    }

    /// Sets the traversal priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}
