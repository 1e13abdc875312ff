//! Step kinds: an atomic service bound to its job, or a workflow.

use std::sync::Arc;

use serde_json::Value;

use armada_workflow::{Service, ServiceKind, Workflow};

use crate::error::RunError;
use crate::job::{Job, JobRegistry};

static NO_PARAMETERS: Value = Value::Null;

/// A service ready to run.
pub(crate) enum Step<'s> {
    /// Runs a job per device.
    Atomic(AtomicStep),
    /// Traverses a member graph.
    Workflow(&'s Workflow),
}

impl<'s> Step<'s> {
    /// Binds a service to what it runs. Atomic services resolve their job
    /// here so an unknown job fails the step before any device is touched.
    pub(crate) fn resolve(service: &'s Arc<Service>, jobs: &JobRegistry) -> Result<Self, RunError> {
        match &service.kind {
            ServiceKind::Atomic { job, .. } => {
                let job = jobs.get(job)?;
                Ok(Step::Atomic(AtomicStep {
                    service: Arc::clone(service),
                    job,
                }))
            }
            ServiceKind::Workflow(workflow) => Ok(Step::Workflow(workflow)),
        }
    }
}

/// An atomic service and its resolved job.
#[derive(Clone)]
pub(crate) struct AtomicStep {
    service: Arc<Service>,
    job: Arc<dyn Job>,
}

impl AtomicStep {
    pub(crate) fn service(&self) -> &Service {
        &self.service
    }

    pub(crate) fn job(&self) -> &dyn Job {
        self.job.as_ref()
    }

    pub(crate) fn parameters(&self) -> &Value {
        match &self.service.kind {
            ServiceKind::Atomic { parameters, .. } => parameters,
            ServiceKind::Workflow(_) => &NO_PARAMETERS,
        }
    }
}
