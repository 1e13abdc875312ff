//! Workflow traversal.
//!
//! Members are visited from a priority queue; higher priorities run first and
//! ties run in the order members were queued. Each queued member carries the
//! devices waiting to visit it. After a member runs, every outgoing edge whose
//! label matches an outcome forwards the matching devices to its destination.
//!
//! In per-device mode each device follows its own outcomes, so a member can be
//! visited several times with disjoint device subsets; a device succeeds iff it
//! reaches *End*. In structural mode the member's aggregate outcome decides,
//! and the workflow succeeds iff *End* was visited.
//!
//! Visits are bounded per member (and per device) by `max_runs`, which is
//! what terminates cyclic graphs.

use core::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use hashbrown::{HashMap, HashSet};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

use armada_workflow::policy::{RunMode, SkipValue};
use armada_workflow::{Device, DeviceId, Member, MemberId, MemberKind, Service, TraversalMode, Workflow};

use crate::config::Settings;
use crate::error::RunError;
use crate::progress::fields;
use crate::result::{ResultStatus, RunResult, StepResult};
use crate::runner::{Runner, StepContext};

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: i32,
    sequence: Reverse<u64>,
    member: MemberId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of one member visit.
enum Visit {
    /// Per-device success flags. Devices absent from the map fire no edges.
    Devices(IndexMap<DeviceId, bool>),
    /// Aggregate success flag.
    Structural(bool),
    /// Nothing fires.
    Discarded,
}

// ─────────────────────────────────────────────────────────────────────────────
// Traversal state
// ─────────────────────────────────────────────────────────────────────────────

struct Traversal<'w> {
    workflow: &'w Workflow,
    per_device: bool,
    default_max_runs: usize,
    queue: BinaryHeap<Entry>,
    sequence: u64,
    /// Devices waiting to visit each member.
    pending: HashMap<MemberId, IndexSet<DeviceId>>,
    /// Members currently in the queue.
    scheduled: HashSet<MemberId>,
    /// Members waiting on prerequisites.
    parked: IndexSet<MemberId>,
    /// Members that ran at least once.
    completed: HashSet<MemberId>,
    /// Visits per member and device (`None` in structural mode).
    runs: HashMap<(MemberId, Option<DeviceId>), usize>,
    reached_end: IndexSet<DeviceId>,
    end_visited: bool,
    discarded: HashSet<DeviceId>,
    /// Last error text seen per device, and for the structural path.
    errors: HashMap<Option<DeviceId>, String>,
}

impl<'w> Traversal<'w> {
    fn new(workflow: &'w Workflow, per_device: bool, default_max_runs: usize) -> Self {
        Self {
            workflow,
            per_device,
            default_max_runs,
            queue: BinaryHeap::new(),
            sequence: 0,
            pending: HashMap::new(),
            scheduled: HashSet::new(),
            parked: IndexSet::new(),
            completed: HashSet::new(),
            runs: HashMap::new(),
            reached_end: IndexSet::new(),
            end_visited: false,
            discarded: HashSet::new(),
            errors: HashMap::new(),
        }
    }

    /// Adds devices to a member's pending set and queues it if needed.
    fn arrive(&mut self, member: MemberId, devices: impl IntoIterator<Item = DeviceId>) {
        self.pending.entry(member).or_default().extend(devices);
        self.schedule(member);
    }

    fn schedule(&mut self, member: MemberId) {
        if !self.scheduled.insert(member) {
            return;
        }
        let priority = self.workflow.member(member).map_or(0, |m| m.priority);
        self.sequence += 1;
        self.queue.push(Entry {
            priority,
            sequence: Reverse(self.sequence),
            member,
        });
    }

    fn is_ready(&self, member: MemberId) -> bool {
        self.workflow
            .prerequisites(member)
            .iter()
            .all(|prerequisite| self.completed.contains(prerequisite))
    }

    /// Takes the devices that may still visit `member`, counting the visit.
    /// Returns `None` once the member is exhausted.
    fn admit(&mut self, member: &Member) -> Option<IndexSet<DeviceId>> {
        let limit = member.max_runs_or(self.default_max_runs);
        let mut arriving = self.pending.remove(&member.id).unwrap_or_default();
        if self.per_device {
            arriving.retain(|device| {
                let runs = self.runs.entry((member.id, Some(*device))).or_insert(0);
                *runs += 1;
                *runs <= limit
            });
            (!arriving.is_empty()).then_some(arriving)
        } else {
            let runs = self.runs.entry((member.id, None)).or_insert(0);
            *runs += 1;
            (*runs <= limit).then_some(arriving)
        }
    }

    /// Fires the outgoing edges of `member` for a visit outcome and returns
    /// `(edge id, count)` for every edge that fired.
    fn fire(&mut self, member: MemberId, visit: &Visit) -> Vec<(String, usize)> {
        self.completed.insert(member);
        let mut fired = Vec::new();
        let edges: Vec<_> = self.workflow.outgoing(member).cloned().collect();
        for edge in edges {
            match visit {
                Visit::Devices(outcomes) => {
                    let devices: Vec<DeviceId> = outcomes
                        .iter()
                        .filter(|(_, success)| edge.label.fires_on(**success))
                        .map(|(device, _)| *device)
                        .collect();
                    if devices.is_empty() {
                        continue;
                    }
                    fired.push((edge.id.as_str().to_owned(), devices.len()));
                    self.arrive(edge.to, devices);
                }
                Visit::Structural(success) => {
                    if edge.label.fires_on(*success) {
                        fired.push((edge.id.as_str().to_owned(), 1));
                        self.arrive(edge.to, []);
                    }
                }
                Visit::Discarded => {}
            }
        }
        let ready: Vec<MemberId> = self
            .parked
            .iter()
            .copied()
            .filter(|parked| self.is_ready(*parked))
            .collect();
        for member in ready {
            self.parked.shift_remove(&member);
            self.schedule(member);
        }
        fired
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traverse
// ─────────────────────────────────────────────────────────────────────────────

/// Runs `workflow` for `devices`. Per-device tracking needs devices; an empty
/// set or `once` mode traverses structurally and lets members resolve their
/// own targets.
pub(crate) async fn traverse(
    ctx: &StepContext,
    service: &Service,
    workflow: &Workflow,
    settings: &Settings,
    devices: &[Device],
    payload: &Value,
) -> Result<RunResult, RunError> {
    let engine = &ctx.engine;
    let per_device = workflow.traversal() == TraversalMode::PerDevice
        && settings.run_mode != RunMode::Once
        && !devices.is_empty();
    let inventory: IndexMap<DeviceId, &Device> = devices.iter().map(|d| (d.id, d)).collect();
    let mut state = Traversal::new(workflow, per_device, engine.config.default_max_runs);

    let entries: Vec<MemberId> = ctx
        .start_members
        .iter()
        .copied()
        .filter(|id| workflow.member(*id).is_some())
        .collect();
    let entries = if entries.is_empty() {
        workflow.entry_members()
    } else {
        entries
    };
    for entry in entries {
        state.arrive(entry, inventory.keys().copied());
    }
    tracing::debug!(per_device, members = workflow.member_count(), "traversal started");

    let mut aborted = false;
    while let Some(Entry { member: id, .. }) = state.queue.pop() {
        if ctx.run.is_stopping() {
            aborted = true;
            ctx.log("traversal aborted".to_owned());
            break;
        }
        state.scheduled.remove(&id);
        let Some(member) = workflow.member(id) else {
            continue;
        };
        if !state.is_ready(id) {
            state.parked.insert(id);
            continue;
        }
        let Some(arriving) = state.admit(member) else {
            tracing::debug!(member = member.name(), "visit bound reached");
            continue;
        };

        let visit = match &member.kind {
            MemberKind::Start => uniform(per_device, &arriving, true),
            MemberKind::End => {
                state.end_visited = true;
                state.reached_end.extend(arriving.iter().copied());
                uniform(per_device, &arriving, true)
            }
            MemberKind::Service(_) if member.skip => {
                let child = ctx.child(member.name());
                child.log(format!("skipped with value {:?}", member.skip_value));
                skip_visit(&child, member, per_device, &arriving, &inventory, &mut state)
            }
            MemberKind::Service(service) => {
                let child = ctx.child(member.name());
                let subset: Vec<Device> = arriving
                    .iter()
                    .filter_map(|id| inventory.get(id).map(|device| (*device).clone()))
                    .collect();
                let inherited = if per_device {
                    Some(subset.as_slice())
                } else if devices.is_empty() {
                    None
                } else {
                    Some(devices)
                };
                let runner = Runner::new(&child, service);
                let result = runner.run(inherited, payload).await?;
                member_visit(member, per_device, &arriving, &result, &mut state)
            }
        };

        for (edge, count) in state.fire(id, &visit) {
            let delta = i64::try_from(count).unwrap_or(i64::MAX);
            ctx.increment(&format!("{}{edge}", fields::EDGE_PREFIX), delta);
        }
    }

    Ok(finish(ctx, service, devices, per_device, aborted || ctx.run.is_stopping(), &state))
}

fn uniform(per_device: bool, arriving: &IndexSet<DeviceId>, success: bool) -> Visit {
    if per_device {
        Visit::Devices(arriving.iter().map(|device| (*device, success)).collect())
    } else {
        Visit::Structural(success)
    }
}

fn skip_visit(
    child: &StepContext,
    member: &Member,
    per_device: bool,
    arriving: &IndexSet<DeviceId>,
    inventory: &IndexMap<DeviceId, &Device>,
    state: &mut Traversal<'_>,
) -> Visit {
    for id in arriving {
        let device = inventory.get(id).copied();
        child.record(&StepResult::skipped(member.name(), device, member.skip_value));
    }
    match member.skip_value {
        SkipValue::Success => uniform(per_device, arriving, true),
        SkipValue::Failure => uniform(per_device, arriving, false),
        SkipValue::Discard => {
            state.discarded.extend(arriving.iter().copied());
            Visit::Discarded
        }
    }
}

fn member_visit(
    member: &Member,
    per_device: bool,
    arriving: &IndexSet<DeviceId>,
    result: &RunResult,
    state: &mut Traversal<'_>,
) -> Visit {
    if !per_device {
        if !result.success {
            let error = result
                .error
                .clone()
                .or_else(|| result.errors().into_iter().next().map(|(_, error)| error))
                .unwrap_or_else(|| "failed".to_owned());
            state.errors.insert(None, format!("{}: {error}", member.name()));
        }
        return Visit::Structural(result.success);
    }

    let mut outcomes = IndexMap::with_capacity(arriving.len());
    for device in arriving {
        match result.devices.get(device) {
            Some(outcome) if outcome.status == ResultStatus::Discarded => {
                state.discarded.insert(*device);
            }
            Some(outcome) if outcome.status == ResultStatus::Aborted => {}
            Some(outcome) => {
                if let Some(error) = outcome.error.as_ref().filter(|_| !outcome.success) {
                    state.errors.insert(Some(*device), format!("{}: {error}", member.name()));
                }
                outcomes.insert(*device, outcome.success);
            }
            None => {
                if !result.success
                    && let Some(error) = &result.error
                {
                    state.errors.insert(Some(*device), format!("{}: {error}", member.name()));
                }
                outcomes.insert(*device, result.success);
            }
        }
    }
    Visit::Devices(outcomes)
}

fn finish(
    ctx: &StepContext,
    service: &Service,
    devices: &[Device],
    per_device: bool,
    aborted: bool,
    state: &Traversal<'_>,
) -> RunResult {
    let mut result = RunResult::new(ctx.run.runtime().clone(), &service.name, &ctx.path);
    let unreached = |key: Option<DeviceId>| {
        state
            .errors
            .get(&key)
            .cloned()
            .unwrap_or_else(|| "did not reach End".to_owned())
    };

    if devices.is_empty() {
        let mut outcome = StepResult::new(&service.name, None);
        outcome.success = state.end_visited;
        if !outcome.success {
            outcome = if aborted {
                StepResult::aborted(&service.name, None)
            } else {
                StepResult::failed(&service.name, None, unreached(None))
            };
        }
        result.insert(outcome);
        return result;
    }

    for device in devices {
        let reached = if per_device {
            state.reached_end.contains(&device.id)
        } else {
            state.end_visited
        };
        let key = per_device.then_some(device.id);
        let outcome = if reached {
            StepResult {
                success: true,
                ..StepResult::new(&service.name, Some(device))
            }
        } else if per_device && state.discarded.contains(&device.id) {
            StepResult::skipped(&service.name, Some(device), SkipValue::Discard)
        } else if aborted {
            StepResult::aborted(&service.name, Some(device))
        } else {
            StepResult::failed(&service.name, Some(device), unreached(key))
        };
        result.insert(outcome);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_prefers_priority_then_insertion_order() {
        let mut queue = BinaryHeap::new();
        for (sequence, priority) in [(1, 0), (2, 5), (3, 0), (4, 5)] {
            queue.push(Entry {
                priority,
                sequence: Reverse(sequence),
                member: MemberId::new(sequence as usize),
            });
        }
        let order: Vec<usize> = core::iter::from_fn(|| queue.pop())
            .map(|entry| entry.member.index())
            .collect();
        assert_eq!(order, [2, 4, 1, 3]);
    }
}
