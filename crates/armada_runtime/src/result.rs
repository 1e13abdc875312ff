//! Run identifiers and result types.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use armada_workflow::policy::{SkipValue, duration_secs};
use armada_workflow::{Device, DeviceId};

// ─────────────────────────────────────────────────────────────────────────────
// RuntimeId
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier of a run lineage.
///
/// Internally uses `Arc<str>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeId(Arc<str>);

impl RuntimeId {
    /// Creates a new runtime ID with a unique nanoid.
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid::nanoid!().into())
    }

    /// Creates a runtime ID from a specific string value.
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

impl Default for RuntimeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StepResult
// ─────────────────────────────────────────────────────────────────────────────

/// How a result came to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The job ran.
    #[default]
    Completed,
    /// The device was skipped; `success` carries the skip value.
    Skipped,
    /// The device was skipped with the `discard` value.
    Discarded,
    /// The device already succeeded in the parent run.
    Recovered,
    /// The lineage was stopped before the device ran.
    Aborted,
}

/// Outcome of the validator, attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationDetail {
    /// Verdict before negation.
    pub matched: bool,
    /// Whether the verdict was inverted.
    pub negated: bool,
    /// Reference entries the output did not contain, for inclusion checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Value>,
}

/// The outcome of one step for one device, or for a device-less step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Service name.
    pub service: String,
    /// Device, for device-level results.
    pub device: Option<DeviceId>,
    /// Device name, for device-level results.
    pub device_name: Option<String>,
    /// Success flag.
    pub success: bool,
    /// How the result came to be.
    pub status: ResultStatus,
    /// Converted output.
    pub result: Value,
    /// Error text of the last failed attempt.
    pub error: Option<String>,
    /// Validator outcome, if validation ran.
    pub validation: Option<ValidationDetail>,
    /// Attempts made.
    pub attempts: u32,
    /// Wall-clock duration.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl StepResult {
    /// Creates an empty completed result.
    #[must_use]
    pub fn new(service: impl Into<String>, device: Option<&Device>) -> Self {
        Self {
            service: service.into(),
            device: device.map(|d| d.id),
            device_name: device.map(|d| d.name.clone()),
            success: false,
            status: ResultStatus::Completed,
            result: Value::Null,
            error: None,
            validation: None,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    /// Creates a failed result carrying `error`.
    #[must_use]
    pub fn failed(service: impl Into<String>, device: Option<&Device>, error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(service, device)
        }
    }

    /// Creates an aborted result.
    #[must_use]
    pub fn aborted(service: impl Into<String>, device: Option<&Device>) -> Self {
        Self {
            status: ResultStatus::Aborted,
            error: Some("run aborted".into()),
            ..Self::new(service, device)
        }
    }

    /// Creates a synthetic result for a skipped device.
    #[must_use]
    pub fn skipped(service: impl Into<String>, device: Option<&Device>, value: SkipValue) -> Self {
        let (success, status) = match value {
            SkipValue::Success => (true, ResultStatus::Skipped),
            SkipValue::Failure => (false, ResultStatus::Skipped),
            SkipValue::Discard => (false, ResultStatus::Discarded),
        };
        Self {
            success,
            status,
            ..Self::new(service, device)
        }
    }

    /// Creates a result for a device recovered from the parent run.
    #[must_use]
    pub fn recovered(service: impl Into<String>, device: Option<&Device>) -> Self {
        Self {
            success: true,
            status: ResultStatus::Recovered,
            ..Self::new(service, device)
        }
    }

    /// Returns the JSON form exposed to expressions.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "success": self.success,
            "result": self.result,
            "error": self.error,
            "device": self.device_name,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Summary and RunResult
// ─────────────────────────────────────────────────────────────────────────────

/// Device names bucketed by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Devices that succeeded, including successful skips and recoveries.
    pub success: Vec<String>,
    /// Devices that failed, including failed skips.
    pub failure: Vec<String>,
    /// Devices skipped with the `discard` value.
    pub discarded: Vec<String>,
    /// Devices that never ran because the lineage was stopped.
    pub aborted: Vec<String>,
}

impl Summary {
    /// Buckets per-device results.
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a StepResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            let name = result
                .device_name
                .clone()
                .unwrap_or_else(|| result.service.clone());
            let bucket = match (result.status, result.success) {
                (ResultStatus::Aborted, _) => &mut summary.aborted,
                (ResultStatus::Discarded, _) => &mut summary.discarded,
                (_, true) => &mut summary.success,
                (_, false) => &mut summary.failure,
            };
            bucket.push(name);
        }
        summary
    }

    /// Returns true if no device failed or was aborted.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failure.is_empty() && self.aborted.is_empty()
    }
}

/// Aggregate outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Run lineage.
    pub runtime: RuntimeId,
    /// Service name.
    pub service: String,
    /// Step path inside the lineage.
    pub path: String,
    /// Aggregate success flag.
    pub success: bool,
    /// Whether the lineage was stopped while this step ran.
    pub aborted: bool,
    /// Per-device buckets.
    pub summary: Summary,
    /// Per-device results, one per device (last outcome wins).
    pub devices: IndexMap<DeviceId, StepResult>,
    /// Device-less result, for `once` steps.
    pub result: Option<StepResult>,
    /// Step-level error, when the step failed before or around dispatch.
    pub error: Option<String>,
    /// Wall-clock duration.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl RunResult {
    /// Creates an empty successful result.
    #[must_use]
    pub fn new(runtime: RuntimeId, service: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            runtime,
            service: service.into(),
            path: path.into(),
            success: true,
            aborted: false,
            summary: Summary::default(),
            devices: IndexMap::new(),
            result: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    /// Creates a failed result carrying a step-level error.
    #[must_use]
    pub fn failed(
        runtime: RuntimeId,
        service: impl Into<String>,
        path: impl Into<String>,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(runtime, service, path)
        }
    }

    /// Records a device result. A later result for the same device replaces
    /// the earlier one.
    pub fn insert(&mut self, result: StepResult) {
        match result.device {
            Some(device) => {
                self.devices.shift_remove(&device);
                self.devices.insert(device, result);
            }
            None => self.result = Some(result),
        }
    }

    /// Recomputes the summary and success flag from the recorded results.
    pub fn aggregate(&mut self) {
        self.summary = Summary::from_results(self.devices.values());
        let device_less = self.result.as_ref().is_none_or(|result| result.success);
        self.success = self.error.is_none() && self.summary.all_passed() && device_less;
    }

    /// Returns the error text per failed device.
    #[must_use]
    pub fn errors(&self) -> Vec<(String, String)> {
        self.devices
            .values()
            .chain(self.result.iter())
            .filter(|result| !result.success)
            .filter_map(|result| {
                let name = result.device_name.clone().unwrap_or_else(|| result.service.clone());
                result.error.clone().map(|error| (name, error))
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run status and report
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a run lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The lineage is executing.
    Running,
    /// The lineage finished.
    Completed,
    /// The lineage was stopped.
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Aborted => "Aborted",
        })
    }
}

/// Final report of a top-level run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run lineage.
    pub runtime: RuntimeId,
    /// Terminal status.
    pub status: RunStatus,
    /// Overall success flag.
    pub success: bool,
    /// Top-level step result.
    pub result: RunResult,
}
