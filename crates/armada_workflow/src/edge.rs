//! Edge types for workflow graphs.
//!
//! Edges connect members of the same workflow and are labeled with the
//! outcome that makes them fire.

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::member::MemberId;

/// Unique identifier for an edge in a workflow.
///
/// Edge IDs are generated using nanoid, providing globally unique identifiers
/// that don't require coordination between workflow instances.
///
/// Internally uses `Arc<str>` for cheap cloning (reference count bump only).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(Arc<str>);

impl EdgeId {
    /// Creates a new edge ID with a unique nanoid.
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid::nanoid!().into())
    }

    /// Creates an edge ID from a specific string value.
    ///
    /// This is primarily useful for testing or when restoring serialized workflows.
    #[must_use]
    pub fn from_string(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge_{}", self.0)
    }
}

/// The outcome that makes an edge fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLabel {
    /// Fires for devices (or a member) that succeeded.
    Success,
    /// Fires for devices (or a member) that failed.
    Failure,
    /// Fires when the source completes, whatever the outcome. The destination
    /// is not ready until every prerequisite source has run.
    Prerequisite,
}

impl EdgeLabel {
    /// Returns true if an edge with this label fires for the given outcome.
    #[must_use]
    pub fn fires_on(self, success: bool) -> bool {
        match self {
            EdgeLabel::Success => success,
            EdgeLabel::Failure => !success,
            EdgeLabel::Prerequisite => true,
        }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeLabel::Success => "success",
            EdgeLabel::Failure => "failure",
            EdgeLabel::Prerequisite => "prerequisite",
        })
    }
}

/// A directed, labeled connection between two members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique identifier for this edge.
    #[serde(default)]
    pub id: EdgeId,
    /// Source member.
    pub from: MemberId,
    /// Destination member.
    pub to: MemberId,
    /// Outcome that makes the edge fire.
    pub label: EdgeLabel,
}

impl Edge {
    /// Creates a new edge.
    #[must_use]
    pub fn new(from: MemberId, to: MemberId, label: EdgeLabel) -> Self {
        Self {
            id: EdgeId::new(),
            from,
            to,
            label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_id_uniqueness() {
        let id1 = EdgeId::new();
        let id2 = EdgeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn labels_fire_on_matching_outcome() {
        assert!(EdgeLabel::Success.fires_on(true));
        assert!(!EdgeLabel::Success.fires_on(false));
        assert!(EdgeLabel::Failure.fires_on(false));
        assert!(EdgeLabel::Prerequisite.fires_on(false));
        assert!(EdgeLabel::Prerequisite.fires_on(true));
    }

    #[test]
    fn edge_creation() {
        let edge = Edge::new(MemberId::new(1), MemberId::new(2), EdgeLabel::Failure);
        assert!(!edge.id.as_str().is_empty());
        assert_eq!(edge.to, MemberId::new(2));
        assert_eq!(edge.label.to_string(), "failure");
    }
}
