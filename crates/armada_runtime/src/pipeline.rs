//! The retry/validation pipeline around one device-level invocation.
//!
//! Per attempt, strictly in order: stop check, pre-processing, job,
//! conversion, post-processing, validation. A failed attempt is retried
//! while the attempt count stays within the allowed retries, which is the
//! smaller of the (possibly revised) retry count and the absolute ceiling.

use core::any::Any;
use core::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;

use armada_workflow::Device;

use crate::config::Settings;
use crate::error::JobError;
use crate::expression::truthy;
use crate::hooks::RunEvent;
use crate::job::{JobContext, connection_key, scope_for};
use crate::result::{ResultStatus, StepResult, ValidationDetail};
use crate::runner::StepContext;
use crate::step::AtomicStep;
use crate::validation::{convert, validate};

/// Outcome of a single attempt.
#[derive(Debug)]
struct Attempt {
    success: bool,
    result: Value,
    error: Option<String>,
    validation: Option<ValidationDetail>,
    /// Retry count requested by post-processing.
    retries: Option<u32>,
}

impl Attempt {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error),
            validation: None,
            retries: None,
        }
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Runs `step` for `device` (or device-less) with retries.
pub(crate) async fn invoke(
    ctx: &StepContext,
    step: &AtomicStep,
    settings: &Settings,
    device: Option<&Device>,
    payload: &Value,
) -> StepResult {
    let started = Instant::now();
    let service = step.service();
    let engine = &ctx.engine;
    let run = &ctx.run;
    let label = device.map_or(service.name.as_str(), |d| d.name.as_str());
    let connection = device.map(|d| connection_key(run.runtime(), service, d));

    if service.connection.start_new_connection
        && let Some(key) = &connection
    {
        engine.cache.evict(key).await;
    }

    let mut result = StepResult::new(service.name.clone(), device);
    let mut retries = settings.retry.retries;
    let mut attempt = 0u32;
    loop {
        if run.is_stopping() {
            ctx.log(format!("{label}: aborted before attempt {}", attempt + 1));
            result = aborted(result);
            break;
        }
        attempt += 1;
        tracing::debug!(device = label, attempt, "attempt");
        engine.hooks.emit(&RunEvent::DeviceAttempt {
            runtime: run.runtime().clone(),
            path: ctx.path.clone(),
            device: device.map(|d| d.id),
            attempt,
        });

        let outcome = AssertUnwindSafe(attempt_once(ctx, step, settings, device, payload, retries))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Attempt::failed(format!("attempt panicked: {}", panic_message(panic.as_ref())))
            });
        if let Some(revised) = outcome.retries {
            retries = revised;
        }
        result.success = outcome.success;
        result.result = outcome.result;
        result.error = outcome.error;
        result.validation = outcome.validation;
        result.attempts = attempt;

        if result.success {
            ctx.log(format!("{label}: succeeded on attempt {attempt}"));
            tracing::debug!(device = label, attempt, "succeeded");
            break;
        }
        let error = result.error.as_deref().unwrap_or("failed");
        let allowed = settings.allowed_retries(retries);
        if attempt > allowed {
            ctx.log(format!("{label}: failed after {attempt} attempt(s): {error}"));
            tracing::warn!(device = label, attempt, error, "attempts exhausted");
            break;
        }

        ctx.log(format!("Retry {attempt}/{allowed} for {label}: {error}"));
        engine.hooks.emit(&RunEvent::DeviceRetry {
            runtime: run.runtime().clone(),
            path: ctx.path.clone(),
            device: label.to_owned(),
            attempt,
            error: result.error.clone(),
        });
        let delay = settings.retry.delay;
        if !delay.is_zero() {
            let cancelled = run.cancellation();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancelled.cancelled() => {
                    ctx.log(format!("{label}: aborted during retry delay"));
                    result = aborted(result);
                    break;
                }
            }
        }
    }

    if service.connection.close_connection
        && let Some(key) = &connection
    {
        engine.cache.evict(key).await;
    }
    result.duration = started.elapsed();
    result
}

fn aborted(result: StepResult) -> StepResult {
    StepResult {
        success: false,
        status: ResultStatus::Aborted,
        result: Value::Null,
        error: Some("run aborted".into()),
        validation: None,
        ..result
    }
}

async fn attempt_once(
    ctx: &StepContext,
    step: &AtomicStep,
    settings: &Settings,
    device: Option<&Device>,
    payload: &Value,
    retries: u32,
) -> Attempt {
    let service = step.service();
    let evaluator = &ctx.engine.evaluator;

    let mut payload = payload.clone();
    if let Some(statements) = &service.preprocessing {
        let mut scope = scope_for(ctx, device, &payload);
        if let Err(err) = evaluator.execute(statements, &mut scope) {
            return Attempt::failed(format!("preprocessing failed: {err}"));
        }
        payload = scope.take("payload").unwrap_or(Value::Null);
    }

    let job_ctx = JobContext::new(ctx, service, step.parameters(), device, &payload, settings);
    let outcome = AssertUnwindSafe(step.job().run(&job_ctx))
        .catch_unwind()
        .await;
    let (mut success, mut result, mut error, mut errored) = match outcome {
        Ok(Ok(value)) => (true, value, None, false),
        Ok(Err(err)) => (false, Value::Null, Some(err.to_string()), true),
        Err(panic) => {
            let err = JobError::Panicked(panic_message(panic.as_ref()));
            (false, Value::Null, Some(err.to_string()), true)
        }
    };

    if !errored {
        match convert(core::mem::take(&mut result), service.conversion) {
            Ok(converted) => result = converted,
            Err(err) => {
                success = false;
                error = Some(err.to_string());
                errored = true;
            }
        }
    }

    let mut revised = None;
    if let Some(statements) = &service.postprocessing
        && service.postprocessing_mode.applies(success)
    {
        let mut scope = scope_for(ctx, device, &payload)
            .with("result", result.clone())
            .with("success", success)
            .with("retries", retries)
            .with("error", error.clone().map_or(Value::Null, Value::String));
        match evaluator.execute(statements, &mut scope) {
            Ok(_) => {
                success = scope.get("success").is_some_and(truthy);
                result = scope.take("result").unwrap_or(Value::Null);
                revised = scope
                    .get("retries")
                    .and_then(Value::as_u64)
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
                if success {
                    error = None;
                }
            }
            Err(err) => {
                success = false;
                error = Some(format!("postprocessing failed: {err}"));
                errored = true;
            }
        }
    }

    // Exceptions are never subject to validation or its negation.
    let mut validation = None;
    if !errored
        && let Some(policy) = &service.validation
        && policy.condition.applies(success)
    {
        match validate(&policy.method, &result) {
            Ok(mut detail) => {
                detail.negated = policy.negative_logic;
                success = detail.matched != policy.negative_logic;
                error = (!success).then(|| {
                    if policy.negative_logic {
                        "validation failed: output matched a negated validator".to_owned()
                    } else {
                        "validation failed: output did not match".to_owned()
                    }
                });
                validation = Some(detail);
            }
            Err(err) => {
                success = false;
                error = Some(err.to_string());
            }
        }
    }

    if !success && error.is_none() {
        error = Some("marked as failed by postprocessing".to_owned());
    }
    Attempt {
        success,
        result,
        error,
        validation,
        retries: revised,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 1");
        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "static");
    }
}
