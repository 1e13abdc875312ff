//! Integration tests for device-level invocation: retries, validation,
//! pre- and post-processing, and failure isolation.
//!
//! These tests verify:
//! - A failing device is attempted `retries + 1` times and keeps the last error
//! - Retry log lines are written before the final outcome line
//! - Negated validation never turns a job error into a success
//! - Post-processing can rewrite the verdict
//! - A panicking job fails only its own device
//! - A failing pre/post-processing statement or skip query fails only its
//!   own device

mod test_utils;

use std::sync::Arc;

use serde_json::{Value, json};

use armada_runtime::prelude::*;
use armada_workflow::prelude::*;
use test_utils::*;

fn flaky(retries: u32, devices: &[u64]) -> Arc<Service> {
    Arc::new(
        Service::atomic(10, "ping", "flaky")
            .with_targets(targets(devices))
            .with_retry(RetryPolicy::new(retries)),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Retries
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_retries_keep_the_last_error() {
    let store = inventory(1);
    let job = FlakyJob::new(10);
    let engine = builder(&store, &SimDriver::new())
        .with_job(job.clone())
        .build()
        .unwrap();

    let report = engine.run(flaky(2, &[1]), RunRequest::new("admin")).await.unwrap();

    assert!(!report.success);
    let outcome = &report.result.devices[&DeviceId(1)];
    assert_eq!(outcome.attempts, 3);
    assert_eq!(job.attempts("r1"), 3);
    assert_eq!(outcome.error.as_deref(), Some("r1 unreachable (attempt 3)"));
    assert_eq!(report.result.summary.failure, ["r1"]);
}

#[tokio::test]
async fn retry_lines_precede_the_success_line() {
    let store = inventory(1);
    let engine = builder(&store, &SimDriver::new())
        .with_job(FlakyJob::new(2))
        .build()
        .unwrap();

    let report = engine.run(flaky(2, &[1]), RunRequest::new("admin")).await.unwrap();
    assert!(report.success);
    assert_eq!(report.result.devices[&DeviceId(1)].attempts, 3);

    let progress = engine.get_progress(&report.runtime).unwrap();
    let logs = progress.logs("ping");
    let retries: Vec<usize> = logs
        .iter()
        .enumerate()
        .filter(|(_, line)| line.starts_with("Retry "))
        .map(|(index, _)| index)
        .collect();
    let success = logs
        .iter()
        .position(|line| line == "r1: succeeded on attempt 3")
        .unwrap();
    assert_eq!(retries.len(), 2);
    assert!(retries.iter().all(|index| *index < success));
    assert_eq!(logs[retries[0]], "Retry 1/2 for r1: r1 unreachable (attempt 1)");
}

#[tokio::test]
async fn retry_ceiling_caps_requested_retries() {
    let store = inventory(1);
    let job = FlakyJob::new(10);
    let engine = builder(&store, &SimDriver::new())
        .with_job(job.clone())
        .build()
        .unwrap();
    let service = Service::atomic(10, "ping", "flaky")
        .with_targets(targets(&[1]))
        .with_retry(RetryPolicy::new(5).with_ceiling(1));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();
    assert_eq!(report.result.devices[&DeviceId(1)].attempts, 2);
    assert_eq!(job.attempts("r1"), 2);
}

#[tokio::test]
async fn postprocessing_can_revise_retries() {
    let store = inventory(1);
    let job = FlakyJob::new(10);
    let engine = builder(&store, &SimDriver::new())
        .with_job(job.clone())
        .build()
        .unwrap();
    let service = Service::atomic(10, "ping", "flaky")
        .with_targets(targets(&[1]))
        .with_retry(RetryPolicy::new(5))
        .with_postprocessing("retries = 0", PostprocessingMode::Failure);

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();
    assert_eq!(job.attempts("r1"), 1);
    assert!(!report.success);
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn validation_fails_unexpected_output() {
    let store = inventory(2);
    let job = FnJob::new("version", |ctx| {
        let name = &ctx.device().unwrap().name;
        Ok(Value::from(if name == "r1" { "Version 2.4" } else { "Version 1.9" }))
    });
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(11, "version", "version")
        .with_targets(targets(&[1, 2]))
        .with_validation(ValidationPolicy::new(ValidationMethod::regex(r"Version 2\.\d")));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.result.summary.success, ["r1"]);
    assert_eq!(report.result.summary.failure, ["r2"]);
    let failed = &report.result.devices[&DeviceId(2)];
    assert_eq!(failed.validation.as_ref().map(|v| v.matched), Some(false));
    assert_eq!(
        failed.error.as_deref(),
        Some("validation failed: output did not match")
    );
}

#[tokio::test]
async fn negated_validation_does_not_mask_job_errors() {
    let store = inventory(1);
    let job = FnJob::new("broken", |_| Err(JobError::failed("device rejected command")));
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(12, "broken", "broken")
        .with_targets(targets(&[1]))
        .with_validation(ValidationPolicy::new(ValidationMethod::text("% Error")).negated());

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    let outcome = &report.result.devices[&DeviceId(1)];
    assert!(!outcome.success);
    assert!(outcome.validation.is_none());
    assert_eq!(outcome.error.as_deref(), Some("device rejected command"));
}

#[tokio::test]
async fn negated_validation_rejects_matching_output() {
    let store = inventory(1);
    let job = FnJob::new("show", |_| Ok(json!("% Error: invalid input")));
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(13, "show", "show")
        .with_targets(targets(&[1]))
        .with_validation(ValidationPolicy::new(ValidationMethod::text("% Error")).negated());

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    let outcome = &report.result.devices[&DeviceId(1)];
    assert!(!outcome.success);
    let detail = outcome.validation.as_ref().unwrap();
    assert!(detail.matched && detail.negated);
}

#[tokio::test]
async fn dict_inclusion_reports_missing_keys() {
    let store = inventory(1);
    let job = FnJob::new("facts", |_| Ok(json!(r#"{"os": "ios", "uptime": 12}"#)));
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(14, "facts", "facts")
        .with_targets(targets(&[1]))
        .with_conversion(ConversionMethod::Json)
        .with_validation(ValidationPolicy::new(ValidationMethod::dict_included(
            json!({"os": "ios", "vendor": "acme"}),
        )));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    let outcome = &report.result.devices[&DeviceId(1)];
    assert_eq!(outcome.result, json!({"os": "ios", "uptime": 12}));
    let detail = outcome.validation.as_ref().unwrap();
    assert!(!detail.matched);
    assert_eq!(detail.missing, Some(json!({"vendor": "acme"})));
}

// ─────────────────────────────────────────────────────────────────────────────
// Pre- and post-processing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn preprocessing_rewrites_the_payload() {
    let store = inventory(1);
    let job = FnJob::new("echo", |ctx| Ok(ctx.payload().clone()));
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(15, "echo", "echo")
        .with_targets(targets(&[1]))
        .with_preprocessing("payload = device.name + '-' + payload");

    let report = engine
        .run(Arc::new(service), RunRequest::new("admin").with_payload(json!("cfg")))
        .await
        .unwrap();
    assert_eq!(report.result.devices[&DeviceId(1)].result, json!("r1-cfg"));
}

#[tokio::test]
async fn postprocessing_overrides_the_verdict() {
    let store = inventory(2);
    let job = FnJob::new("count", |ctx| {
        Ok(json!({"sessions": if ctx.device().unwrap().name == "r1" { 3 } else { 0 }}))
    });
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(16, "count", "count")
        .with_targets(targets(&[1, 2]))
        .with_postprocessing("success = result.sessions > 0", PostprocessingMode::Success);

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert_eq!(report.result.summary.success, ["r1"]);
    let failed = &report.result.devices[&DeviceId(2)];
    assert_eq!(failed.error.as_deref(), Some("marked as failed by postprocessing"));
}

#[tokio::test]
async fn postprocessing_can_recover_a_failure() {
    let store = inventory(1);
    let job = FnJob::new("noisy", |_| Err(JobError::failed("warning only")));
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(17, "noisy", "noisy")
        .with_targets(targets(&[1]))
        .with_postprocessing(
            "success = startswith(error, 'warning'); result = 'tolerated'",
            PostprocessingMode::Failure,
        );

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    let outcome = &report.result.devices[&DeviceId(1)];
    assert!(outcome.success);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result, json!("tolerated"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failure isolation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn panicking_job_fails_only_its_device() {
    let store = inventory(3);
    let job = FnJob::new("fragile", |ctx| {
        if ctx.device().unwrap().name == "r2" {
            panic!("driver state corrupted");
        }
        Ok(json!("ok"))
    });
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    let service = Service::atomic(18, "fragile", "fragile")
        .with_targets(targets(&[1, 2, 3]))
        .with_run_mode(RunMode::PerDeviceParallel);

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert_eq!(report.result.summary.success, ["r1", "r3"]);
    let failed = &report.result.devices[&DeviceId(2)];
    assert_eq!(
        failed.error.as_deref(),
        Some("job panicked: driver state corrupted")
    );
}

/// Overflows for `r2` only: `and` short-circuits for every other device.
const OVERFLOW_ON_R2: &str = "device.name == 'r2' and (-9223372036854775807 - 1) % -1";

fn isolated(id: u64, name: &str) -> Service {
    Service::atomic(id, name, "steady")
        .with_targets(targets(&[1, 2, 3]))
        .with_run_mode(RunMode::PerDevice)
}

async fn run_isolated(service: Service) -> RunReport {
    let store = inventory(3);
    let job = FnJob::new("steady", |_| Ok(json!("ok")));
    let engine = builder(&store, &SimDriver::new()).with_job(job).build().unwrap();
    engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap()
}

#[tokio::test]
async fn failing_postprocessing_fails_only_its_device() {
    let service = isolated(20, "post")
        .with_postprocessing(format!("x = {OVERFLOW_ON_R2}"), PostprocessingMode::Always);

    let report = run_isolated(service).await;

    assert!(report.result.error.is_none());
    assert_eq!(report.result.summary.success, ["r1", "r3"]);
    assert_eq!(report.result.summary.failure, ["r2"]);
    assert_eq!(
        report.result.devices[&DeviceId(2)].error.as_deref(),
        Some("postprocessing failed: type error: integer overflow")
    );
}

#[tokio::test]
async fn failing_preprocessing_fails_only_its_device() {
    let service = isolated(21, "pre").with_preprocessing(format!("x = {OVERFLOW_ON_R2}"));

    let report = run_isolated(service).await;

    assert_eq!(report.result.summary.success, ["r1", "r3"]);
    assert_eq!(
        report.result.devices[&DeviceId(2)].error.as_deref(),
        Some("preprocessing failed: type error: integer overflow")
    );
}

#[tokio::test]
async fn failing_skip_query_fails_only_its_device() {
    let service = isolated(22, "guarded").with_skip(SkipPolicy {
        query: Some("device.name == 'r2' and len('ab' * 9223372036854775807) > 0".into()),
        ..SkipPolicy::default()
    });

    let report = run_isolated(service).await;

    assert!(report.result.error.is_none());
    assert_eq!(report.result.summary.success, ["r1", "r3"]);
    assert_eq!(report.result.summary.failure, ["r2"]);
    let failed = &report.result.devices[&DeviceId(2)];
    assert_eq!(
        failed.error.as_deref(),
        Some("skip query failed: value would exceed 1048576 elements")
    );
}

#[tokio::test]
async fn unknown_job_fails_the_step() {
    let store = inventory(1);
    let engine = builder(&store, &SimDriver::new()).build().unwrap();
    let service = Service::atomic(19, "mystery", "reboot").with_targets(targets(&[1]));

    let report = engine.run(Arc::new(service), RunRequest::new("admin")).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.result.error.as_deref(), Some("unknown job: reboot"));
}
