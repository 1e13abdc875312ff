//! Integration tests for workflow traversal.
//!
//! These tests verify:
//! - Per-device success/failure branching with every device reaching End
//! - Structural traversal firing edges on the aggregate outcome
//! - Prerequisite gating and priority ordering
//! - Skipped members, including discard
//! - Nested workflows and the nesting limit
//! - Skip policies on once-mode workflows
//! - Termination on arbitrary cyclic graphs

mod test_utils;

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;

use armada_runtime::prelude::*;
use armada_workflow::prelude::*;
use test_utils::*;

/// A job named `mark` that records `service@device` and fails on `r2`.
fn marking_job(visits: &Arc<Mutex<Vec<String>>>) -> Arc<FnJob> {
    let visits = Arc::clone(visits);
    FnJob::new("mark", move |ctx| {
        let device = ctx.device().map_or("-", |d| d.name.as_str());
        visits.lock().push(format!("{}@{device}", ctx.service().name));
        if device == "r2" && ctx.service().name == "check" {
            return Err(JobError::failed("check failed on r2"));
        }
        Ok(json!(device))
    })
}

fn mark(id: u64, name: &str) -> Service {
    Service::atomic(id, name, "mark")
}

fn visited(visits: &Mutex<Vec<String>>, service: &str) -> Vec<String> {
    let prefix = format!("{service}@");
    visits
        .lock()
        .iter()
        .filter_map(|visit| visit.strip_prefix(&prefix).map(str::to_owned))
        .collect()
}

/// `Start -> check`, `check -success-> tag -> End`, `check -failure-> fix -> End`.
fn branching(traversal: TraversalMode) -> Service {
    let mut workflow = Workflow::new().with_traversal(traversal);
    let (start, end) = (workflow.start(), workflow.end());
    let check = workflow.add_service(mark(1, "check"));
    let tag = workflow.add_service(mark(2, "tag"));
    let fix = workflow.add_service(mark(3, "fix"));
    workflow
        .on_success(start, check)
        .unwrap()
        .on_success(check, tag)
        .unwrap()
        .on_failure(check, fix)
        .unwrap()
        .on_success(tag, end)
        .unwrap()
        .on_success(fix, end)
        .unwrap();
    Service::workflow(50, "audit", workflow).with_targets(targets(&[1, 2, 3]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Branching
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn devices_follow_their_own_outcomes() {
    let store = inventory(3);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();

    let report = engine
        .run(Arc::new(branching(TraversalMode::PerDevice)), RunRequest::new("admin"))
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.result.summary.success, ["r1", "r2", "r3"]);
    assert_eq!(visited(&visits, "check"), ["r1", "r2", "r3"]);
    assert_eq!(visited(&visits, "tag"), ["r1", "r3"]);
    assert_eq!(visited(&visits, "fix"), ["r2"]);

    let progress = engine.get_progress(&report.runtime).unwrap();
    assert_eq!(progress.counter("audit/check", "success"), 2);
    assert_eq!(progress.counter("audit/check", "failure"), 1);
    assert_eq!(progress.counter("audit/tag", "success"), 2);
}

#[tokio::test]
async fn structural_traversal_branches_on_the_aggregate() {
    let store = inventory(3);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();

    let report = engine
        .run(Arc::new(branching(TraversalMode::Structural)), RunRequest::new("admin"))
        .await
        .unwrap();

    assert!(report.success);
    assert!(visited(&visits, "tag").is_empty());
    assert_eq!(visited(&visits, "fix"), ["r1", "r2", "r3"]);
}

#[tokio::test]
async fn devices_without_a_matching_edge_fail_the_workflow() {
    let store = inventory(3);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let check = workflow.add_service(mark(1, "check"));
    workflow
        .on_success(start, check)
        .unwrap()
        .on_success(check, end)
        .unwrap();
    let service = Service::workflow(51, "audit", workflow).with_targets(targets(&[1, 2, 3]));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.result.summary.failure, ["r2"]);
    assert_eq!(
        report.result.devices[&DeviceId(2)].error.as_deref(),
        Some("check: check failed on r2")
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn prerequisites_gate_and_priority_orders() {
    let store = inventory(1);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let backup = workflow.add_service(mark(1, "backup"));
    let drain = workflow.add_service(mark(2, "drain").with_priority(5));
    let upgrade = workflow.add_service(mark(3, "upgrade"));
    workflow
        .on_success(start, backup)
        .unwrap()
        .on_success(start, drain)
        .unwrap()
        .requires(upgrade, backup)
        .unwrap()
        .requires(upgrade, drain)
        .unwrap()
        .on_success(upgrade, end)
        .unwrap();
    let service = Service::workflow(52, "maintenance", workflow).with_targets(targets(&[1]));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(report.success);
    assert_eq!(
        *visits.lock(),
        ["drain@r1", "backup@r1", "upgrade@r1"]
    );
}

#[tokio::test]
async fn start_members_replace_start() {
    let store = inventory(1);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let backup = workflow.add_service(mark(1, "backup"));
    let upgrade = workflow.add_service(mark(2, "upgrade"));
    workflow
        .on_success(start, backup)
        .unwrap()
        .on_success(backup, upgrade)
        .unwrap()
        .on_success(upgrade, end)
        .unwrap();
    let service = Service::workflow(53, "maintenance", workflow).with_targets(targets(&[1]));

    let report = engine
        .run(
            Arc::new(service),
            RunRequest::new("admin").with_start_members([upgrade]),
        )
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(*visits.lock(), ["upgrade@r1"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Skipping
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn skipped_members_fire_their_skip_value() {
    let store = inventory(2);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let backup = workflow.add_service(mark(1, "backup"));
    let report = workflow.add_service(mark(2, "report"));
    workflow.member_mut(backup).unwrap().skip = true;
    workflow
        .on_success(start, backup)
        .unwrap()
        .on_success(backup, report)
        .unwrap()
        .on_success(report, end)
        .unwrap();
    let service = Service::workflow(54, "nightly", workflow).with_targets(targets(&[1, 2]));

    let outcome = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(outcome.success);
    assert!(visited(&visits, "backup").is_empty());
    assert_eq!(visited(&visits, "report"), ["r1", "r2"]);
}

#[tokio::test]
async fn discarded_devices_stop_without_failing() {
    let store = inventory(2);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let backup = workflow.add_service(mark(1, "backup"));
    let member = workflow.member_mut(backup).unwrap();
    member.skip = true;
    member.skip_value = SkipValue::Discard;
    workflow
        .on_success(start, backup)
        .unwrap()
        .on_success(backup, end)
        .unwrap()
        .on_failure(backup, end)
        .unwrap();
    let service = Service::workflow(55, "nightly", workflow).with_targets(targets(&[1, 2]));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert_eq!(report.result.summary.discarded, ["r1", "r2"]);
    assert!(report.result.summary.failure.is_empty());
    assert!(visits.lock().is_empty());
}

#[tokio::test]
async fn skip_query_selects_devices_to_skip() {
    let store = inventory(3);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let service = mark(56, "backup")
        .with_targets(targets(&[1, 2, 3]))
        .with_skip(SkipPolicy {
            query: Some("device.site == 'lon'".into()),
            ..SkipPolicy::default()
        });

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(report.success);
    assert_eq!(visited(&visits, "backup"), ["r1", "r3"]);
    assert_eq!(
        report.result.devices[&DeviceId(2)].status,
        ResultStatus::Skipped
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Nesting and once mode
// ─────────────────────────────────────────────────────────────────────────────

fn wrap(id: u64, name: &str, inner: Service) -> Service {
    let mut workflow = Workflow::new();
    let (start, end) = (workflow.start(), workflow.end());
    let member = workflow.add_service(inner);
    workflow
        .on_success(start, member)
        .unwrap()
        .on_success(member, end)
        .unwrap();
    Service::workflow(id, name, workflow)
}

#[tokio::test]
async fn nested_workflows_inherit_devices() {
    let store = inventory(2);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let service = wrap(60, "outer", wrap(61, "inner", mark(1, "backup")))
        .with_targets(targets(&[1, 2]));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(report.success);
    assert_eq!(visited(&visits, "backup"), ["r1", "r2"]);
    let progress = engine.get_progress(&report.runtime).unwrap();
    assert_eq!(progress.counter("outer/inner/backup", "success"), 2);
}

#[tokio::test]
async fn nesting_beyond_the_limit_fails() {
    let store = inventory(1);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_config(EngineConfig {
            max_nesting_depth: 1,
            ..EngineConfig::default()
        })
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let service = wrap(62, "outer", wrap(63, "inner", mark(1, "backup")))
        .with_targets(targets(&[1]));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(!report.success);
    assert!(visits.lock().is_empty());
    assert_eq!(
        report.result.devices[&DeviceId(1)].error.as_deref(),
        Some("inner: workflow nesting exceeds the limit of 1")
    );
}

#[tokio::test]
async fn once_workflow_runs_without_devices() {
    let store = inventory(1);
    let engine = builder(&store, &SimDriver::new()).build().unwrap();
    let check = Service::atomic(1, "check", "expression")
        .with_parameters(json!({"expression": "len(payload.sites)"}))
        .with_run_mode(RunMode::Once)
        .with_validation(ValidationPolicy::new(ValidationMethod::text("2")));
    let service = wrap(64, "preflight", check).with_run_mode(RunMode::Once);

    let report = engine
        .run(
            Arc::new(service),
            RunRequest::new("admin").with_payload(json!({"sites": ["par", "lon"]})),
        )
        .await
        .unwrap();

    assert!(report.success);
    assert!(report.result.devices.is_empty());
    assert!(report.result.result.as_ref().is_some_and(|outcome| outcome.success));
}

#[tokio::test]
async fn skipped_once_workflow_runs_no_member() {
    let store = inventory(1);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let inner = mark(2, "check").with_run_mode(RunMode::Once);
    let service = wrap(65, "preflight", inner)
        .with_run_mode(RunMode::Once)
        .with_skip(SkipPolicy {
            skip: true,
            value: SkipValue::Failure,
            ..SkipPolicy::default()
        });

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(visits.lock().is_empty());
    assert!(!report.success);
    let outcome = report.result.result.as_ref().unwrap();
    assert_eq!(outcome.status, ResultStatus::Skipped);
}

#[tokio::test]
async fn once_workflow_with_every_target_skipped_does_not_run() {
    let store = inventory(3);
    let visits = Arc::new(Mutex::new(Vec::new()));
    let engine = builder(&store, &SimDriver::new())
        .with_job(marking_job(&visits))
        .build()
        .unwrap();
    let inner = mark(3, "check").with_run_mode(RunMode::Once);
    let service = wrap(66, "preflight", inner)
        .with_run_mode(RunMode::Once)
        .with_targets(targets(&[1, 2, 3]))
        .with_skip(SkipPolicy {
            query: Some("len(device.name) > 0".into()),
            ..SkipPolicy::default()
        });

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(visits.lock().is_empty());
    assert!(report.success);
    assert_eq!(report.result.devices.len(), 3);
    assert!(
        report
            .result
            .devices
            .values()
            .all(|outcome| outcome.status == ResultStatus::Skipped)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Termination
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a graph of `members` atomic members wired by `edges`, where index 0
/// is *Start*, index 1 is *End* and the rest are members. Edges rejected by
/// the graph (into *Start*, out of *End*) are dropped.
fn arbitrary_workflow(members: usize, edges: &[(usize, usize, u8)], max_runs: usize) -> Workflow {
    let mut workflow = Workflow::new();
    let mut ids = vec![workflow.start(), workflow.end()];
    for index in 0..members {
        let id = workflow.add_service(Service::atomic(index as u64, format!("m{index}"), "coin"));
        if let Some(member) = workflow.member_mut(id) {
            member.max_runs = Some(max_runs);
        }
        ids.push(id);
    }
    for (from, to, label) in edges {
        let (from, to) = (ids[from % ids.len()], ids[to % ids.len()]);
        let label = match label % 3 {
            0 => EdgeLabel::Success,
            1 => EdgeLabel::Failure,
            _ => EdgeLabel::Prerequisite,
        };
        let _ = workflow.connect(from, to, label);
    }
    workflow
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn traversal_terminates_within_visit_bounds(
        members in 1usize..6,
        edges in prop::collection::vec((0usize..8, 0usize..8, 0u8..3), 0..20),
        max_runs in 1usize..3,
        devices in 1u64..4,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let store = inventory(devices);
        let coin = FnJob::new("coin", |ctx| {
            let device = ctx.device().map_or(0, |d| d.id.index());
            if (ctx.service().id.0 + device) % 2 == 0 {
                Ok(json!("heads"))
            } else {
                Err(JobError::failed("tails"))
            }
        });
        let engine = builder(&store, &SimDriver::new())
            .with_job(coin.clone())
            .build()
            .unwrap();
        let workflow = arbitrary_workflow(members, &edges, max_runs);
        let ids: Vec<u64> = (1..=devices).collect();
        let service = Service::workflow(99, "random", workflow).with_targets(targets(&ids));

        let report = runtime
            .block_on(engine.run(Arc::new(service), RunRequest::new("admin")))
            .unwrap();

        let bound = members * max_runs * usize::try_from(devices).unwrap();
        prop_assert!(coin.calls() <= bound);
        prop_assert_eq!(report.result.devices.len(), ids.len());
        let summary = &report.result.summary;
        prop_assert_eq!(summary.success.len() + summary.failure.len(), ids.len());
    }
}
