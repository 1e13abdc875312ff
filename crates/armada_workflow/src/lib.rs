//! Data model for Armada runs.
//!
//! `armada_workflow` defines what the run engine executes: the device
//! inventory, services and their policies, and the workflow graph that
//! composes services into success/failure-labeled flows.
//!
//! # Core Concepts
//!
//! - [`Device`] and [`Pool`] - the targets services run against
//! - [`Service`] - an atomic job or a workflow, plus its policies
//! - [`Workflow`] - directed graph of members with *Start*/*End* sentinels
//! - [`Edge`] - `success`, `failure` or `prerequisite` connections
//!
//! # Example
//!
//! ```
//! use armada_workflow::prelude::*;
//!
//! let ping = Service::atomic(1, "ping", "command")
//!     .with_retry(RetryPolicy::new(2))
//!     .with_run_mode(RunMode::PerDeviceParallel);
//!
//! let mut workflow = Workflow::new();
//! let step = workflow.add_service(ping);
//! let (start, end) = (workflow.start(), workflow.end());
//! workflow.on_success(start, step).unwrap();
//! workflow.on_success(step, end).unwrap();
//! workflow.on_failure(step, end).unwrap();
//!
//! let service = Service::workflow(2, "health check", workflow);
//! assert!(service.is_workflow());
//! ```

/// Devices and device pools.
pub mod device;

/// Edge types for connecting workflow members.
pub mod edge;

/// Builder errors.
pub mod error;

/// Workflow members and sentinels.
pub mod member;

/// Service policies.
pub mod policy;

/// Services.
pub mod service;

/// Workflow graph structure and builder API.
pub mod workflow;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::device::{Device, DeviceId, Pool};
    pub use crate::edge::{Edge, EdgeId, EdgeLabel};
    pub use crate::error::WorkflowError;
    pub use crate::member::{Member, MemberId, MemberKind};
    pub use crate::policy::{
        ConnectionPolicy, ConversionMethod, CredentialMode, NotificationPolicy,
        PostprocessingMode, RetryPolicy, RunMode, SkipPolicy, SkipValue, TargetConfig,
        ValidationCondition, ValidationMethod, ValidationPolicy,
    };
    pub use crate::service::{Service, ServiceId, ServiceKind};
    pub use crate::workflow::{IdAllocator, TraversalMode, ValidationError, Workflow};
}

// Re-export key types at crate root for convenience
pub use device::{Device, DeviceId, Pool};
pub use edge::{Edge, EdgeId, EdgeLabel};
pub use error::WorkflowError;
pub use member::{Member, MemberId, MemberKind};
pub use service::{Service, ServiceId, ServiceKind};
pub use workflow::{TraversalMode, ValidationError, Workflow};
