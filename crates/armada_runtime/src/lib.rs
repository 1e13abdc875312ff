//! The Armada run execution engine.
//!
//! `armada_runtime` takes a service or workflow from `armada_workflow` plus
//! a set of target devices and drives it to completion: resolving targets,
//! retrying and validating device-level invocations, caching device sessions
//! across steps, tracking live progress, and traversing workflow graphs with
//! per-device success/failure branching.
//!
//! # Core Concepts
//!
//! - [`Engine`] - entry points: `run`, `start_run`, `get_progress`,
//!   `request_stop`, `get_result`
//! - [`Job`] - the logic an atomic service runs per device
//! - [`ConnectionDriver`] / [`Session`] - pluggable device transports
//! - [`ConnectionCache`] - sessions shared by the steps of a run lineage
//! - [`ProgressStore`] - live counters and logs keyed by step path
//! - [`RunHooks`] - lifecycle observers
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use armada_runtime::prelude::*;
//! use armada_workflow::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() {
//! let engine = Engine::builder().build().unwrap();
//! let check = Service::atomic(1, "check", "expression")
//!     .with_parameters(json!({"expression": "len(payload.sites) == 2"}))
//!     .with_run_mode(RunMode::Once)
//!     .with_validation(ValidationPolicy::new(ValidationMethod::text("true")));
//!
//! let report = engine
//!     .run(
//!         Arc::new(check),
//!         RunRequest::new("admin").with_payload(json!({"sites": ["par", "lon"]})),
//!     )
//!     .await
//!     .unwrap();
//! assert!(report.success);
//! # }
//! ```

/// Collaborator interfaces and their in-memory implementations.
pub mod collab;

/// Engine and run-level settings.
pub mod config;

/// Device sessions, drivers and the connection cache.
pub mod connection;

/// Engine entry points.
pub mod engine;

/// Error types.
pub mod error;

/// The restricted expression evaluator.
pub mod expression;

/// Lifecycle hooks.
pub mod hooks;

/// Jobs and the job registry.
pub mod job;

/// Active run lineages.
pub mod manager;

/// Run notifications.
pub mod notify;

/// Live progress tracking.
pub mod progress;

/// Run identifiers and results.
pub mod result;

/// Target resolution.
pub mod targets;

/// Tracing setup.
pub mod telemetry;

/// Output conversion and validators.
pub mod validation;

mod pipeline;
mod runner;
mod step;
mod traversal;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::collab::{
        Authorization, CredentialResolver, Credentials, DeviceScope, MemoryPersistence,
        Persistence, ResultRecord, RunRecord, Secret, StaticAuthorization, StaticCredentials,
    };
    pub use crate::config::{EngineConfig, RunOverrides, Settings};
    pub use crate::connection::{
        ConnectionCache, ConnectionDriver, ConnectionHandle, ConnectionKey, DriverRegistry,
        Session,
    };
    pub use crate::engine::{Engine, EngineBuilder, RunRequest};
    pub use crate::error::{
        ConfigError, ConnectionError, ExpressionError, JobError, NotifyError, PersistenceError,
        RunError,
    };
    pub use crate::expression::{Evaluator, ResultLookup, Scope};
    pub use crate::hooks::{HookRegistrationError, RunEvent, RunEventKind, RunHooks};
    pub use crate::job::{Job, JobContext, JobRegistry};
    pub use crate::notify::{LogNotifier, Notification, Notifier, NotifierRegistry};
    pub use crate::progress::{MemoryProgressStore, ProgressRecord, ProgressStore};
    pub use crate::result::{
        ResultStatus, RunReport, RunResult, RunStatus, RuntimeId, StepResult, Summary,
        ValidationDetail,
    };
    pub use crate::telemetry::{TracingConfig, TracingFormat};
}

pub use connection::{ConnectionCache, ConnectionDriver, Session};
pub use engine::{Engine, EngineBuilder, RunRequest};
pub use error::RunError;
pub use hooks::RunHooks;
pub use job::Job;
pub use progress::ProgressStore;
pub use result::{RunReport, RunResult, RuntimeId, StepResult};
