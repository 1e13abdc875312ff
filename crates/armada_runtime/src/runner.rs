//! The run coordinator.
//!
//! A [`Runner`] drives one invocation of one service inside a lineage:
//!
//! 1. resolve targets, unless inherited from the parent step
//! 2. set aside devices recovered from the parent run or skipped
//! 3. dispatch the rest (`once`, sequential, or a bounded worker pool), or
//!    hand them to the traversal engine for workflow services
//! 4. aggregate, persist, and report progress
//!
//! Failures anywhere in those steps become a failed [`RunResult`]. The only
//! error that crosses the runner boundary is [`RunError::ResourceExhausted`].

use core::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use hashbrown::HashSet;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use armada_workflow::policy::RunMode;
use armada_workflow::{Device, DeviceId, MemberId, Service};

use crate::collab::ResultRecord;
use crate::config::{RunOverrides, Settings};
use crate::engine::EngineInner;
use crate::error::{PersistenceError, RunError};
use crate::expression::truthy;
use crate::hooks::RunEvent;
use crate::job::scope_for;
use crate::manager::RunState;
use crate::pipeline::{self, panic_message};
use crate::progress::fields;
use crate::result::{ResultStatus, RunResult, StepResult};
use crate::step::{AtomicStep, Step};
use crate::targets::TargetResolver;
use crate::traversal;

// ─────────────────────────────────────────────────────────────────────────────
// StepContext
// ─────────────────────────────────────────────────────────────────────────────

/// Where a step runs: the engine, its lineage, and its path inside it.
#[derive(Clone)]
pub(crate) struct StepContext {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) run: Arc<RunState>,
    pub(crate) path: String,
    pub(crate) depth: usize,
    pub(crate) overrides: Option<RunOverrides>,
    pub(crate) start_members: Vec<MemberId>,
}

impl StepContext {
    pub(crate) fn root(
        engine: Arc<EngineInner>,
        run: Arc<RunState>,
        overrides: Option<RunOverrides>,
        start_members: Vec<MemberId>,
    ) -> Self {
        let path = run.service().to_owned();
        Self {
            engine,
            run,
            path,
            depth: 0,
            overrides,
            start_members,
        }
    }

    /// Context of a member step. Overrides and start members only apply to
    /// the step they were given for.
    pub(crate) fn child(&self, name: &str) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            run: Arc::clone(&self.run),
            path: format!("{}/{name}", self.path),
            depth: self.depth + 1,
            overrides: None,
            start_members: Vec::new(),
        }
    }

    pub(crate) fn log(&self, line: String) {
        self.engine.progress.log(self.run.runtime(), &self.path, line);
    }

    pub(crate) fn increment(&self, field: &str, delta: i64) {
        self.engine
            .progress
            .increment(self.run.runtime(), &self.path, field, delta);
    }

    pub(crate) fn set(&self, field: &str, value: Value) {
        self.engine
            .progress
            .set(self.run.runtime(), &self.path, field, value);
    }

    /// Counts a finished device result and indexes it for `get_result`.
    pub(crate) fn record(&self, result: &StepResult) {
        let field = match (result.status, result.success) {
            (ResultStatus::Aborted, _) => fields::ABORTED,
            (ResultStatus::Skipped | ResultStatus::Discarded, _) => fields::SKIPPED,
            (_, true) => fields::SUCCESS,
            (_, false) => fields::FAILURE,
        };
        self.increment(field, 1);
        self.run.record_result(result);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runner
// ─────────────────────────────────────────────────────────────────────────────

/// Runs one service for one step of a lineage.
pub(crate) struct Runner<'a> {
    ctx: &'a StepContext,
    service: &'a Arc<Service>,
    settings: Settings,
}

impl<'a> Runner<'a> {
    pub(crate) fn new(ctx: &'a StepContext, service: &'a Arc<Service>) -> Self {
        let settings = Settings::resolve(service, ctx.overrides.as_ref(), &ctx.engine.config);
        Self {
            ctx,
            service,
            settings,
        }
    }

    /// Runs the step. `inherited` carries the parent step's devices; `None`
    /// resolves the service's own targets.
    ///
    /// Returns a boxed future since workflow members recurse into it.
    pub(crate) fn run(
        &'a self,
        inherited: Option<&'a [Device]>,
        payload: &'a Value,
    ) -> BoxFuture<'a, Result<RunResult, RunError>> {
        let span = tracing::info_span!(
            "step",
            runtime = %self.ctx.run.runtime(),
            path = %self.ctx.path,
            service = %self.service.name,
        );
        Box::pin(
            async move {
                let started = Instant::now();
                let ctx = self.ctx;
                let runtime = ctx.run.runtime().clone();
                ctx.engine.hooks.emit(&RunEvent::StepStart {
                    runtime: runtime.clone(),
                    path: ctx.path.clone(),
                    targets: inherited.map_or(0, <[Device]>::len),
                });
                ctx.set(fields::STATUS, Value::from("Running"));

                let outcome = AssertUnwindSafe(self.execute(inherited, payload))
                    .catch_unwind()
                    .await;
                let mut result = match outcome {
                    Ok(Ok(result)) => result,
                    Ok(Err(err @ RunError::ResourceExhausted(_))) => return Err(err),
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "step failed");
                        ctx.log(format!("step failed: {err}"));
                        RunResult::failed(runtime.clone(), &self.service.name, &ctx.path, err)
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(panic = %message, "step panicked");
                        ctx.log(format!("step panicked: {message}"));
                        RunResult::failed(
                            runtime.clone(),
                            &self.service.name,
                            &ctx.path,
                            format!("step panicked: {message}"),
                        )
                    }
                };

                result.aborted = ctx.run.is_stopping();
                result.duration = started.elapsed();
                self.persist(&mut result).await;

                let status = if result.aborted { "Aborted" } else { "Completed" };
                ctx.set(fields::STATUS, Value::from(status));
                tracing::info!(
                    success = result.success,
                    aborted = result.aborted,
                    devices = result.devices.len(),
                    "step finished"
                );
                ctx.engine.hooks.emit(&RunEvent::StepComplete {
                    runtime,
                    path: ctx.path.clone(),
                    success: result.success,
                    duration: result.duration,
                });
                Ok(result)
            }
            .instrument(span),
        )
    }

    async fn execute(
        &self,
        inherited: Option<&[Device]>,
        payload: &Value,
    ) -> Result<RunResult, RunError> {
        let ctx = self.ctx;
        let service = self.service;
        let devices = self.targets(inherited, payload).await?;
        let once = self.settings.run_mode == RunMode::Once;
        if devices.is_empty() && !once && service.targets.require_targets {
            return Err(RunError::NoTargets {
                service: service.name.clone(),
            });
        }
        ctx.set(fields::TOTAL, Value::from(devices.len()));

        let step = Step::resolve(service, &ctx.engine.jobs)?;
        let mut result = RunResult::new(ctx.run.runtime().clone(), &service.name, &ctx.path);
        let recovered = self.recovered().await?;

        match step {
            Step::Atomic(step) if once => {
                let outcome = if recovered.contains(&None) {
                    StepResult::recovered(&service.name, None)
                } else if service.skip.skip {
                    StepResult::skipped(&service.name, None, service.skip.value)
                } else {
                    pipeline::invoke(ctx, &step, &self.settings, None, payload).await
                };
                ctx.record(&outcome);
                result.insert(outcome);
            }
            Step::Atomic(step) => {
                let active = self.partition(devices, &recovered, payload, &mut result);
                self.dispatch(&step, active, payload, &mut result).await?;
            }
            Step::Workflow(workflow) => {
                if ctx.depth >= ctx.engine.config.max_nesting_depth {
                    result.error = Some(format!(
                        "workflow nesting exceeds the limit of {}",
                        ctx.engine.config.max_nesting_depth
                    ));
                } else if once
                    && devices.is_empty()
                    && (service.skip.skip || recovered.contains(&None))
                {
                    let outcome = if recovered.contains(&None) {
                        StepResult::recovered(&service.name, None)
                    } else {
                        StepResult::skipped(&service.name, None, service.skip.value)
                    };
                    ctx.record(&outcome);
                    result.insert(outcome);
                } else {
                    let targeted = !devices.is_empty();
                    let active = self.partition(devices, &recovered, payload, &mut result);
                    // A once-mode workflow runs only if some target survived.
                    if once && targeted && active.is_empty() {
                        result.aggregate();
                        return Ok(result);
                    }
                    let traversed =
                        traversal::traverse(ctx, service, workflow, &self.settings, &active, payload)
                            .await?;
                    for outcome in traversed.devices.into_values() {
                        ctx.record(&outcome);
                        result.insert(outcome);
                    }
                    if let Some(outcome) = traversed.result {
                        ctx.record(&outcome);
                        result.insert(outcome);
                    }
                }
            }
        }

        result.aggregate();
        Ok(result)
    }

    async fn targets(
        &self,
        inherited: Option<&[Device]>,
        payload: &Value,
    ) -> Result<Vec<Device>, RunError> {
        let ctx = self.ctx;
        match inherited {
            Some(devices) if !self.service.targets.recompute => Ok(devices.to_vec()),
            _ => {
                let engine = &ctx.engine;
                let scope = scope_for(ctx, None, payload);
                TargetResolver::new(
                    engine.persistence.as_ref(),
                    engine.authorization.as_ref(),
                    &engine.evaluator,
                )
                .resolve(&self.service.targets, ctx.run.creator(), &scope)
                .await
            }
        }
    }

    /// Devices (or `None` for the device-less result) that already succeeded
    /// at this path in the parent run.
    async fn recovered(&self) -> Result<HashSet<Option<DeviceId>>, RunError> {
        let Some(parent) = self.ctx.run.parent() else {
            return Ok(HashSet::new());
        };
        let records = self.ctx.engine.persistence.results(parent).await?;
        Ok(records
            .into_iter()
            .filter(|record| {
                record.path == self.ctx.path
                    && record.result.service == self.service.name
                    && record.result.success
                    && record.result.status != ResultStatus::Discarded
            })
            .map(|record| record.result.device)
            .collect())
    }

    /// Records synthetic results for recovered and skipped devices and
    /// returns the devices that still need to run.
    fn partition(
        &self,
        devices: Vec<Device>,
        recovered: &HashSet<Option<DeviceId>>,
        payload: &Value,
        result: &mut RunResult,
    ) -> Vec<Device> {
        let ctx = self.ctx;
        let service = self.service;
        let skip = &service.skip;
        let mut active = Vec::with_capacity(devices.len());
        for device in devices {
            let synthetic = if recovered.contains(&Some(device.id)) {
                Some(StepResult::recovered(&service.name, Some(&device)))
            } else if skip.skip {
                Some(StepResult::skipped(&service.name, Some(&device), skip.value))
            } else if let Some(query) = &skip.query {
                let scope = scope_for(ctx, Some(&device), payload);
                match ctx.engine.evaluator.evaluate(query, &scope) {
                    Ok(value) if truthy(&value) => {
                        Some(StepResult::skipped(&service.name, Some(&device), skip.value))
                    }
                    Ok(_) => None,
                    Err(err) => Some(StepResult::failed(
                        &service.name,
                        Some(&device),
                        format!("skip query failed: {err}"),
                    )),
                }
            } else {
                None
            };
            match synthetic {
                Some(outcome) => {
                    ctx.record(&outcome);
                    result.insert(outcome);
                }
                None => active.push(device),
            }
        }
        active
    }

    async fn dispatch(
        &self,
        step: &AtomicStep,
        active: Vec<Device>,
        payload: &Value,
        result: &mut RunResult,
    ) -> Result<(), RunError> {
        let ctx = self.ctx;
        let parallel = self.settings.run_mode == RunMode::PerDeviceParallel && active.len() > 1;
        if !parallel {
            for device in &active {
                let outcome = pipeline::invoke(ctx, step, &self.settings, Some(device), payload).await;
                ctx.record(&outcome);
                result.insert(outcome);
            }
            return Ok(());
        }

        let workers = self.settings.max_processes.min(active.len());
        if workers > Semaphore::MAX_PERMITS {
            return Err(RunError::ResourceExhausted(format!(
                "cannot create a pool of {workers} workers"
            )));
        }
        tracing::debug!(workers, devices = active.len(), "parallel dispatch");
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for (index, device) in active.iter().cloned().enumerate() {
            let permits = Arc::clone(&permits);
            let ctx = ctx.clone();
            let step = step.clone();
            let settings = self.settings.clone();
            let payload = payload.clone();
            tasks.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        let outcome = StepResult::failed(
                            &step.service().name,
                            Some(&device),
                            "worker pool closed",
                        );
                        return (index, outcome);
                    };
                    let outcome = AssertUnwindSafe(pipeline::invoke(
                        &ctx,
                        &step,
                        &settings,
                        Some(&device),
                        &payload,
                    ))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        StepResult::failed(
                            &step.service().name,
                            Some(&device),
                            format!("worker panicked: {}", panic_message(panic.as_ref())),
                        )
                    });
                    (index, outcome)
                }
                .in_current_span(),
            );
        }

        let mut outcomes: Vec<Option<StepResult>> = vec![None; active.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    ctx.record(&outcome);
                    outcomes[index] = Some(outcome);
                }
                Err(err) => tracing::error!(error = %err, "device worker did not complete"),
            }
        }
        for (device, outcome) in active.iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|| {
                let lost = StepResult::failed(
                    &self.service.name,
                    Some(device),
                    "device worker did not report a result",
                );
                ctx.record(&lost);
                lost
            });
            result.insert(outcome);
        }
        Ok(())
    }

    /// Stages every result of the step and commits. A persistence failure
    /// rolls back and downgrades the step to a failure.
    async fn persist(&self, result: &mut RunResult) {
        let ctx = self.ctx;
        let persistence = &ctx.engine.persistence;
        let outcome: Result<(), PersistenceError> = async {
            let records = result
                .devices
                .values()
                .chain(result.result.iter())
                .cloned()
                .chain((!result.devices.is_empty()).then(|| aggregate_record(result)));
            for record in records {
                persistence
                    .create_result(ResultRecord {
                        runtime: result.runtime.clone(),
                        path: ctx.path.clone(),
                        result: record,
                    })
                    .await?;
            }
            persistence.commit().await
        }
        .await;

        if let Err(err) = outcome {
            tracing::error!(error = %err, "failed to persist step results");
            if let Err(rollback) = persistence.rollback().await {
                tracing::error!(error = %rollback, "rollback failed");
            }
            ctx.log(format!("persistence failed: {err}"));
            result.error = Some(RunError::from(err).to_string());
            result.success = false;
        }
    }
}

/// The device-less record summarizing a per-device step.
fn aggregate_record(result: &RunResult) -> StepResult {
    StepResult {
        success: result.success,
        result: serde_json::to_value(&result.summary).unwrap_or(Value::Null),
        error: result.error.clone(),
        duration: result.duration,
        ..StepResult::new(result.service.clone(), None)
    }
}
