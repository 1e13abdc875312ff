//! Run services and workflows against fleets of network devices.
//!
//! | Crate | Re-exported as | Contents |
//! |-------|----------------|----------|
//! | `armada_workflow` | [`workflow`] | devices, services, policies, workflow graphs |
//! | `armada_runtime` | [`runtime`] | the engine, jobs, connections, results, progress |
//! | `armada_notifiers` | [`notifiers`] (feature `notifiers`) | webhook and chat transports |
//!
//! ```no_run
//! use std::sync::Arc;
//! use armada::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::builder().build()?;
//! let service = Service::atomic(1, "hello", "expression")
//!     .with_parameters(json!({"expression": "'hello ' + payload.name"}));
//! let report = engine
//!     .run(Arc::new(service), RunRequest::new("admin").with_payload(json!({"name": "fleet"})))
//!     .await?;
//! assert!(report.success);
//! # Ok(())
//! # }
//! ```

pub use armada_runtime as runtime;
pub use armada_workflow as workflow;

#[cfg(feature = "notifiers")]
pub use armada_notifiers as notifiers;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use armada_runtime::prelude::*;
    pub use armada_workflow::prelude::*;

    #[cfg(feature = "notifiers")]
    pub use armada_notifiers::{ChatNotifier, WebhookNotifier};
}
