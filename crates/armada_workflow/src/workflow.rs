//! Workflow graph structure and builder API.
//!
//! A [`Workflow`] is a directed graph of member services connected by
//! labeled edges. It always owns exactly one *Start* and one *End* sentinel;
//! both are created by [`Workflow::new`] and cannot be added or removed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::edge::{Edge, EdgeId, EdgeLabel};
use crate::error::WorkflowError;
use crate::member::{Member, MemberId, MemberKind};
use crate::service::Service;

// ─────────────────────────────────────────────────────────────────────────────
// ID Allocator
// ─────────────────────────────────────────────────────────────────────────────

/// Shared allocator for generating unique member IDs.
///
/// Uses `Arc<AtomicUsize>` for thread-safe, lock-free ID generation. Clones
/// share the same counter.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next_member_id: Arc<AtomicUsize>,
}

impl IdAllocator {
    /// Creates a new ID allocator starting at 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator whose next ID is `next`.
    #[must_use]
    pub fn starting_at(next: usize) -> Self {
        Self {
            next_member_id: Arc::new(AtomicUsize::new(next)),
        }
    }

    /// Allocates the next unique member ID.
    pub fn allocate_member_id(&self) -> MemberId {
        let id = self.next_member_id.fetch_add(1, Ordering::Relaxed);
        MemberId::new(id)
    }

    /// Returns the current member ID counter value (for debugging).
    #[must_use]
    pub fn current_member_id(&self) -> usize {
        self.next_member_id.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traversal Mode
// ─────────────────────────────────────────────────────────────────────────────

/// How outcomes decide which edges fire during traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalMode {
    /// The member's aggregate outcome alone decides which edges fire.
    Structural,
    /// Each device flows through the graph on its own outcome.
    #[default]
    PerDevice,
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow
// ─────────────────────────────────────────────────────────────────────────────

/// A directed graph of member services.
///
/// # Example
///
/// ```
/// use armada_workflow::prelude::*;
///
/// let mut workflow = Workflow::new();
/// let backup = workflow.add_service(Service::atomic(1, "backup", "command"));
/// let (start, end) = (workflow.start(), workflow.end());
/// workflow
///     .on_success(start, backup)
///     .unwrap()
///     .on_success(backup, end)
///     .unwrap();
/// assert!(workflow.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "WorkflowDef", into = "WorkflowDef")]
pub struct Workflow {
    /// All members, in insertion order.
    members: IndexMap<MemberId, Member>,
    /// All edges, in insertion order.
    edges: Vec<Edge>,
    /// The *Start* sentinel.
    start: MemberId,
    /// The *End* sentinel.
    end: MemberId,
    /// Members traversal is seeded with. Empty means *Start*.
    start_members: Vec<MemberId>,
    /// Edge firing granularity.
    traversal: TraversalMode,
    /// Shared allocator for unique member IDs.
    allocator: IdAllocator,
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    /// Creates a workflow holding only the *Start* and *End* sentinels.
    #[must_use]
    pub fn new() -> Self {
        let allocator = IdAllocator::new();
        let start = allocator.allocate_member_id();
        let end = allocator.allocate_member_id();
        let mut members = IndexMap::new();
        members.insert(start, Member::new(start, MemberKind::Start));
        members.insert(end, Member::new(end, MemberKind::End));
        Self {
            members,
            edges: Vec::new(),
            start,
            end,
            start_members: Vec::new(),
            traversal: TraversalMode::default(),
            allocator,
        }
    }

    /// Sets the traversal granularity.
    #[must_use]
    pub fn with_traversal(mut self, traversal: TraversalMode) -> Self {
        self.traversal = traversal;
        self
    }

    /// Returns the *Start* sentinel.
    #[must_use]
    pub fn start(&self) -> MemberId {
        self.start
    }

    /// Returns the *End* sentinel.
    #[must_use]
    pub fn end(&self) -> MemberId {
        self.end
    }

    /// Returns the traversal granularity.
    #[must_use]
    pub fn traversal(&self) -> TraversalMode {
        self.traversal
    }

    /// Returns all members in insertion order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Returns the number of members, sentinels included.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Returns all edges.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Looks up a member.
    #[must_use]
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// Looks up a member for modification (priority, skip flag, `max_runs`).
    pub fn member_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.members.get_mut(&id)
    }

    /// Finds the first member whose name matches.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Member> {
        self.members.values().find(|member| member.name() == name)
    }

    /// Adds a member service and returns its ID.
    ///
    /// The member starts with the service's priority.
    pub fn add_service(&mut self, service: impl Into<Arc<Service>>) -> MemberId {
        let id = self.allocator.allocate_member_id();
        self.members
            .insert(id, Member::new(id, MemberKind::Service(service.into())));
        id
    }

    /// Connects two members with a labeled edge.
    ///
    /// # Errors
    ///
    /// Fails if either member is unknown, if the edge would enter *Start*, or
    /// if it would leave *End*.
    pub fn connect(
        &mut self,
        from: MemberId,
        to: MemberId,
        label: EdgeLabel,
    ) -> Result<EdgeId, WorkflowError> {
        for id in [from, to] {
            if !self.members.contains_key(&id) {
                return Err(WorkflowError::UnknownMember(id));
            }
        }
        if to == self.start {
            return Err(WorkflowError::EdgeIntoStart);
        }
        if from == self.end {
            return Err(WorkflowError::EdgeFromEnd);
        }
        let edge = Edge::new(from, to, label);
        let id = edge.id.clone();
        self.edges.push(edge);
        Ok(id)
    }

    /// Adds a `success` edge. Returns self for chaining.
    ///
    /// # Errors
    ///
    /// See [`Workflow::connect`].
    pub fn on_success(&mut self, from: MemberId, to: MemberId) -> Result<&mut Self, WorkflowError> {
        self.connect(from, to, EdgeLabel::Success)?;
        Ok(self)
    }

    /// Adds a `failure` edge. Returns self for chaining.
    ///
    /// # Errors
    ///
    /// See [`Workflow::connect`].
    pub fn on_failure(&mut self, from: MemberId, to: MemberId) -> Result<&mut Self, WorkflowError> {
        self.connect(from, to, EdgeLabel::Failure)?;
        Ok(self)
    }

    /// Makes `prerequisite` a prerequisite of `member`. Returns self for chaining.
    ///
    /// # Errors
    ///
    /// See [`Workflow::connect`].
    pub fn requires(
        &mut self,
        member: MemberId,
        prerequisite: MemberId,
    ) -> Result<&mut Self, WorkflowError> {
        self.connect(prerequisite, member, EdgeLabel::Prerequisite)?;
        Ok(self)
    }

    /// Seeds traversal with the given members instead of *Start*.
    ///
    /// # Errors
    ///
    /// Fails if any member is unknown.
    pub fn set_start_members(
        &mut self,
        members: impl IntoIterator<Item = MemberId>,
    ) -> Result<(), WorkflowError> {
        let members: Vec<MemberId> = members.into_iter().collect();
        if let Some(unknown) = members.iter().find(|id| !self.members.contains_key(*id)) {
            return Err(WorkflowError::UnknownMember(*unknown));
        }
        self.start_members = members;
        Ok(())
    }

    /// Returns the members traversal is seeded with.
    #[must_use]
    pub fn entry_members(&self) -> Vec<MemberId> {
        if self.start_members.is_empty() {
            vec![self.start]
        } else {
            self.start_members.clone()
        }
    }

    /// Returns the edges leaving a member.
    pub fn outgoing(&self, id: MemberId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.from == id)
    }

    /// Returns the edges entering a member.
    pub fn incoming(&self, id: MemberId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.to == id)
    }

    /// Returns the sources of every prerequisite edge entering a member.
    #[must_use]
    pub fn prerequisites(&self, id: MemberId) -> Vec<MemberId> {
        self.incoming(id)
            .filter(|edge| edge.label == EdgeLabel::Prerequisite)
            .map(|edge| edge.from)
            .collect()
    }

    /// Validates the workflow structure.
    ///
    /// Checks:
    /// - exactly one *Start* and one *End* member
    /// - *Start* has no incoming edges, *End* has no outgoing edges
    /// - every edge and start member references a member of this workflow
    /// - every member may run at least once
    ///
    /// # Errors
    ///
    /// Returns every defect found.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let starts: Vec<MemberId> = self
            .members
            .values()
            .filter(|member| matches!(member.kind, MemberKind::Start))
            .map(|member| member.id)
            .collect();
        let ends: Vec<MemberId> = self
            .members
            .values()
            .filter(|member| member.is_end())
            .map(|member| member.id)
            .collect();
        match starts.len() {
            0 => errors.push(ValidationError::MissingStart),
            1 => {}
            _ => errors.push(ValidationError::MultipleStarts(starts)),
        }
        match ends.len() {
            0 => errors.push(ValidationError::MissingEnd),
            1 => {}
            _ => errors.push(ValidationError::MultipleEnds(ends)),
        }

        for edge in &self.edges {
            if !self.members.contains_key(&edge.from) {
                errors.push(ValidationError::InvalidEdgeSource {
                    edge: edge.id.clone(),
                    member: edge.from,
                });
            }
            if !self.members.contains_key(&edge.to) {
                errors.push(ValidationError::InvalidEdgeTarget {
                    edge: edge.id.clone(),
                    member: edge.to,
                });
            }
            if edge.to == self.start {
                errors.push(ValidationError::StartHasIncoming(edge.id.clone()));
            }
            if edge.from == self.end {
                errors.push(ValidationError::EndHasOutgoing(edge.id.clone()));
            }
        }

        for id in &self.start_members {
            if !self.members.contains_key(id) {
                errors.push(ValidationError::InvalidStartMember(*id));
            }
        }

        for member in self.members.values() {
            if member.max_runs == Some(0) {
                errors.push(ValidationError::ZeroMaxRuns {
                    member: member.id,
                    name: member.name().to_owned(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serialized Form
// ─────────────────────────────────────────────────────────────────────────────

/// Wire representation of a [`Workflow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkflowDef {
    members: Vec<Member>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    start_members: Vec<MemberId>,
    #[serde(default)]
    traversal: TraversalMode,
}

impl From<Workflow> for WorkflowDef {
    fn from(workflow: Workflow) -> Self {
        Self {
            members: workflow.members.into_values().collect(),
            edges: workflow.edges,
            start_members: workflow.start_members,
            traversal: workflow.traversal,
        }
    }
}

impl TryFrom<WorkflowDef> for Workflow {
    type Error = WorkflowError;

    fn try_from(def: WorkflowDef) -> Result<Self, Self::Error> {
        let mut members = IndexMap::with_capacity(def.members.len());
        for member in def.members {
            let id = member.id;
            if members.insert(id, member).is_some() {
                return Err(WorkflowError::DuplicateMember(id));
            }
        }
        let find = |wanted: fn(&MemberKind) -> bool| {
            members
                .values()
                .find(|member: &&Member| wanted(&member.kind))
                .map(|member| member.id)
        };
        let start = find(|kind| matches!(kind, MemberKind::Start))
            .ok_or(WorkflowError::Invalid(vec![ValidationError::MissingStart]))?;
        let end = find(|kind| matches!(kind, MemberKind::End))
            .ok_or(WorkflowError::Invalid(vec![ValidationError::MissingEnd]))?;
        let next = members.keys().map(|id| id.index() + 1).max().unwrap_or(0);

        let workflow = Self {
            members,
            edges: def.edges,
            start,
            end,
            start_members: def.start_members,
            traversal: def.traversal,
            allocator: IdAllocator::starting_at(next),
        };
        workflow.validate().map_err(WorkflowError::Invalid)?;
        Ok(workflow)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Structural defects detected by [`Workflow::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The workflow has no *Start* member.
    MissingStart,
    /// The workflow has no *End* member.
    MissingEnd,
    /// The workflow has more than one *Start* member.
    MultipleStarts(Vec<MemberId>),
    /// The workflow has more than one *End* member.
    MultipleEnds(Vec<MemberId>),
    /// An edge enters *Start*.
    StartHasIncoming(EdgeId),
    /// An edge leaves *End*.
    EndHasOutgoing(EdgeId),
    /// An edge's source member doesn't exist.
    InvalidEdgeSource {
        /// The edge ID.
        edge: EdgeId,
        /// The invalid member ID.
        member: MemberId,
    },
    /// An edge's target member doesn't exist.
    InvalidEdgeTarget {
        /// The edge ID.
        edge: EdgeId,
        /// The invalid member ID.
        member: MemberId,
    },
    /// A start member doesn't exist.
    InvalidStartMember(MemberId),
    /// A member can never run.
    ZeroMaxRuns {
        /// The member ID.
        member: MemberId,
        /// The member name.
        name: String,
    },
}

impl core::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ValidationError::MissingStart => write!(f, "workflow has no Start member"),
            ValidationError::MissingEnd => write!(f, "workflow has no End member"),
            ValidationError::MultipleStarts(ids) => {
                write!(f, "workflow has {} Start members", ids.len())
            }
            ValidationError::MultipleEnds(ids) => {
                write!(f, "workflow has {} End members", ids.len())
            }
            ValidationError::StartHasIncoming(edge) => {
                write!(f, "edge {edge} enters the Start member")
            }
            ValidationError::EndHasOutgoing(edge) => {
                write!(f, "edge {edge} leaves the End member")
            }
            ValidationError::InvalidEdgeSource { edge, member } => {
                write!(f, "edge {edge} has invalid source member: {member}")
            }
            ValidationError::InvalidEdgeTarget { edge, member } => {
                write!(f, "edge {edge} has invalid target member: {member}")
            }
            ValidationError::InvalidStartMember(member) => {
                write!(f, "start member {member} is not part of the workflow")
            }
            ValidationError::ZeroMaxRuns { member, name } => {
                write!(f, "member '{name}' ({member}) has max_runs = 0")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: u64, name: &str) -> Service {
        Service::atomic(id, name, "command")
    }

    #[test]
    fn new_workflow_has_sentinels() {
        let workflow = Workflow::new();
        assert_eq!(workflow.member_count(), 2);
        assert_eq!(workflow.member(workflow.start()).unwrap().name(), "Start");
        assert_eq!(workflow.member(workflow.end()).unwrap().name(), "End");
        assert_eq!(workflow.entry_members(), vec![workflow.start()]);
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn allocator_shares_counter_between_clones() {
        let allocator = IdAllocator::new();
        let clone = allocator.clone();
        assert_eq!(allocator.allocate_member_id(), MemberId::new(0));
        assert_eq!(clone.allocate_member_id(), MemberId::new(1));
        assert_eq!(allocator.current_member_id(), 2);
    }

    #[test]
    fn connect_rejects_edges_into_start_and_out_of_end() {
        let mut workflow = Workflow::new();
        let a = workflow.add_service(service(1, "a"));
        let (start, end) = (workflow.start(), workflow.end());

        assert!(matches!(
            workflow.connect(a, start, EdgeLabel::Success),
            Err(WorkflowError::EdgeIntoStart)
        ));
        assert!(matches!(
            workflow.connect(end, a, EdgeLabel::Failure),
            Err(WorkflowError::EdgeFromEnd)
        ));
        assert!(matches!(
            workflow.connect(a, MemberId::new(99), EdgeLabel::Success),
            Err(WorkflowError::UnknownMember(_))
        ));
    }

    #[test]
    fn prerequisites_lists_sources() {
        let mut workflow = Workflow::new();
        let a = workflow.add_service(service(1, "a"));
        let b = workflow.add_service(service(2, "b"));
        let c = workflow.add_service(service(3, "c"));
        workflow.requires(c, a).unwrap().requires(c, b).unwrap();
        assert_eq!(workflow.prerequisites(c), vec![a, b]);
        assert!(workflow.prerequisites(a).is_empty());
    }

    #[test]
    fn validate_reports_zero_max_runs() {
        let mut workflow = Workflow::new();
        let a = workflow.add_service(service(1, "a"));
        workflow.member_mut(a).unwrap().max_runs = Some(0);
        let errors = workflow.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("'a'"));
    }

    #[test]
    fn serde_round_trip_keeps_structure() {
        let mut workflow = Workflow::new().with_traversal(TraversalMode::Structural);
        let a = workflow.add_service(service(1, "a"));
        let (start, end) = (workflow.start(), workflow.end());
        workflow.on_success(start, a).unwrap().on_failure(a, end).unwrap();

        let json = serde_json::to_value(&workflow).unwrap();
        let restored: Workflow = serde_json::from_value(json).unwrap();
        assert_eq!(restored.member_count(), 3);
        assert_eq!(restored.edges().len(), 2);
        assert_eq!(restored.traversal(), TraversalMode::Structural);

        let mut restored = restored;
        let b = restored.add_service(service(2, "b"));
        assert_eq!(b, MemberId::new(3));
    }

    #[test]
    fn deserializing_an_edge_into_start_fails() {
        let json = serde_json::json!({
            "members": [
                {"id": 0, "kind": {"type": "start"}},
                {"id": 1, "kind": {"type": "end"}}
            ],
            "edges": [{"from": 1, "to": 0, "label": "success"}]
        });
        let err = serde_json::from_value::<Workflow>(json).unwrap_err();
        assert!(err.to_string().contains("Start"));
    }
}
