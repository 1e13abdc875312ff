//! Workflow builder errors.

use thiserror::Error;

use crate::member::MemberId;
use crate::workflow::ValidationError;

/// Errors raised while building or restoring a workflow.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// A member ID does not belong to the workflow.
    #[error("unknown member: {0}")]
    UnknownMember(MemberId),

    /// Two serialized members share an ID.
    #[error("duplicate member: {0}")]
    DuplicateMember(MemberId),

    /// An edge would enter the *Start* member.
    #[error("edges cannot enter the Start member")]
    EdgeIntoStart,

    /// An edge would leave the *End* member.
    #[error("edges cannot leave the End member")]
    EdgeFromEnd,

    /// The restored workflow failed validation.
    #[error("invalid workflow: {}", join(.0))]
    Invalid(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
