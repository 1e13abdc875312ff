//! Workflow members.
//!
//! Members are the vertices of a workflow graph. Every workflow owns exactly
//! one *Start* and one *End* sentinel; all other members wrap a service, which
//! may be shared across several workflows.

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::policy::SkipValue;
use crate::service::Service;

/// Unique identifier for a member within a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub(crate) usize);

impl MemberId {
    /// Creates a new member ID.
    #[must_use]
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member_{}", self.0)
    }
}

/// What a member runs when visited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "service", rename_all = "snake_case")]
pub enum MemberKind {
    /// The entry sentinel.
    Start,
    /// The exit sentinel.
    End,
    /// A member service.
    Service(Arc<Service>),
}

/// A vertex of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Unique identifier within the workflow.
    pub id: MemberId,
    /// What runs when the member is visited.
    pub kind: MemberKind,
    /// Traversal priority. Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Skip the member inside this workflow without invoking it.
    #[serde(default)]
    pub skip: bool,
    /// Outcome recorded when the member is skipped.
    #[serde(default)]
    pub skip_value: SkipValue,
    /// How many times the member may be visited (per device in per-device
    /// tracking mode). Bounds traversal on cyclic graphs. `None` uses the
    /// engine default.
    #[serde(default)]
    pub max_runs: Option<usize>,
}

impl Member {
    pub(crate) fn new(id: MemberId, kind: MemberKind) -> Self {
        let priority = match &kind {
            MemberKind::Service(service) => service.priority,
            MemberKind::Start | MemberKind::End => 0,
        };
        Self {
            id,
            kind,
            priority,
            skip: false,
            skip_value: SkipValue::default(),
            max_runs: None,
        }
    }

    /// Returns the member's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            MemberKind::Start => "Start",
            MemberKind::End => "End",
            MemberKind::Service(service) => &service.name,
        }
    }

    /// Returns the wrapped service, if this is not a sentinel.
    #[must_use]
    pub fn service(&self) -> Option<&Arc<Service>> {
        match &self.kind {
            MemberKind::Service(service) => Some(service),
            MemberKind::Start | MemberKind::End => None,
        }
    }

    /// Returns true for the *Start* and *End* sentinels.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, MemberKind::Start | MemberKind::End)
    }

    /// Returns the visit bound, falling back to `default`.
    #[must_use]
    pub fn max_runs_or(&self, default: usize) -> usize {
        self.max_runs.unwrap_or(default)
    }

    /// Returns true for the *End* sentinel.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self.kind, MemberKind::End)
    }
}
