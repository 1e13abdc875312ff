//! Per-service execution policies.
//!
//! Each policy is a plain value type attached to a [`Service`](crate::Service).
//! The runtime reads them through its layered settings lookup, so a run-local
//! override always wins over the value stored here.

use core::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::DeviceId;

// ─────────────────────────────────────────────────────────────────────────────
// Targets
// ─────────────────────────────────────────────────────────────────────────────

/// Where a step's target devices come from.
///
/// The resolved target set is the de-duplicated union of all three sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Explicit device references.
    pub devices: Vec<DeviceId>,
    /// Pool names whose members are expanded.
    pub pools: Vec<String>,
    /// Dynamic selection expression. It may evaluate to a list of device names,
    /// device IDs, device objects, or a single scalar.
    pub query: Option<String>,
    /// Recompute targets for this step instead of inheriting the workflow's.
    pub recompute: bool,
    /// Fail with `NoTargets` when a per-device run resolves no devices.
    pub require_targets: bool,
}

impl TargetConfig {
    /// Returns true if no target source is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.pools.is_empty() && self.query.is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run mode
// ─────────────────────────────────────────────────────────────────────────────

/// How a step dispatches over its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// A single device-less invocation.
    Once,
    /// One invocation per device, sequentially.
    #[default]
    PerDevice,
    /// One invocation per device on a bounded worker pool.
    PerDeviceParallel,
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded retry policy for a device-level invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub retries: u32,
    /// Delay between two attempts.
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// Absolute ceiling on retries, including retries granted by post-processing.
    /// `None` falls back to the engine's configured ceiling.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `retries` retries and no delay.
    #[must_use]
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the absolute retry ceiling.
    #[must_use]
    pub fn with_ceiling(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion and post-processing
// ─────────────────────────────────────────────────────────────────────────────

/// How a job's raw output is converted before validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMethod {
    /// Keep the raw value.
    #[default]
    None,
    /// Stringify the value.
    Text,
    /// Parse a string value as JSON.
    Json,
}

/// When post-processing runs, relative to the invocation's success state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostprocessingMode {
    /// Always run.
    #[default]
    Always,
    /// Only after a successful invocation.
    Success,
    /// Only after a failed invocation.
    Failure,
}

impl PostprocessingMode {
    /// Returns true if post-processing applies to a result with the given success.
    #[must_use]
    pub fn applies(self, success: bool) -> bool {
        match self {
            PostprocessingMode::Always => true,
            PostprocessingMode::Success => success,
            PostprocessingMode::Failure => !success,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// When the validator runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCondition {
    /// Never validate.
    #[default]
    Never,
    /// Validate results that succeeded so far.
    Success,
    /// Validate results that failed so far.
    Failure,
    /// Always validate.
    Always,
}

impl ValidationCondition {
    /// Returns true if validation applies to a result with the given success.
    #[must_use]
    pub fn applies(self, success: bool) -> bool {
        match self {
            ValidationCondition::Never => false,
            ValidationCondition::Success => success,
            ValidationCondition::Failure => !success,
            ValidationCondition::Always => true,
        }
    }
}

/// The validator to apply to converted output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ValidationMethod {
    /// Substring or regular-expression match against the stringified output.
    Text {
        /// The substring or pattern.
        content: String,
        /// Interpret `content` as a regular expression.
        #[serde(default)]
        regex: bool,
        /// Strip surrounding whitespace from both sides before comparing.
        #[serde(default)]
        strip: bool,
    },
    /// Exact equality with a reference structure.
    DictEqual {
        /// The reference structure.
        reference: Value,
    },
    /// The output must contain everything the reference describes.
    DictIncluded {
        /// The reference structure.
        reference: Value,
    },
}

impl ValidationMethod {
    /// Substring match.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        ValidationMethod::Text {
            content: content.into(),
            regex: false,
            strip: false,
        }
    }

    /// Regular-expression match.
    #[must_use]
    pub fn regex(pattern: impl Into<String>) -> Self {
        ValidationMethod::Text {
            content: pattern.into(),
            regex: true,
            strip: false,
        }
    }

    /// Exact structural equality.
    #[must_use]
    pub fn dict_equal(reference: Value) -> Self {
        ValidationMethod::DictEqual { reference }
    }

    /// Structural inclusion.
    #[must_use]
    pub fn dict_included(reference: Value) -> Self {
        ValidationMethod::DictIncluded { reference }
    }
}

/// Validation settings for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// When the validator runs.
    #[serde(default)]
    pub condition: ValidationCondition,
    /// The validator.
    pub method: ValidationMethod,
    /// Invert the validator's verdict.
    #[serde(default)]
    pub negative_logic: bool,
}

impl ValidationPolicy {
    /// Creates a policy that validates successful results with `method`.
    #[must_use]
    pub fn new(method: ValidationMethod) -> Self {
        Self {
            condition: ValidationCondition::Success,
            method,
            negative_logic: false,
        }
    }

    /// Sets the condition under which validation runs.
    #[must_use]
    pub fn when(mut self, condition: ValidationCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Inverts the validator's verdict.
    #[must_use]
    pub fn negated(mut self) -> Self {
        self.negative_logic = true;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Skip
// ─────────────────────────────────────────────────────────────────────────────

/// The synthetic outcome recorded for a skipped device or member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipValue {
    /// Report the skipped device as a success.
    #[default]
    Success,
    /// Report the skipped device as a failure.
    Failure,
    /// Report the skipped device in neither bucket.
    Discard,
}

/// Skip settings for a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipPolicy {
    /// Skip the whole step.
    pub skip: bool,
    /// Per-device expression; devices for which it is truthy are skipped.
    pub query: Option<String>,
    /// Outcome recorded for skipped devices.
    pub value: SkipValue,
}

// ─────────────────────────────────────────────────────────────────────────────
// Connections and credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Connection reuse settings for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPolicy {
    /// Driver kind; falls back to the device's driver.
    pub driver: Option<String>,
    /// Logical connection name, so one device can hold several sessions.
    pub name: String,
    /// Evict any cached session before use.
    pub start_new_connection: bool,
    /// Close the session after the invocation instead of caching it.
    pub close_connection: bool,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            driver: None,
            name: "default".into(),
            start_new_connection: false,
            close_connection: false,
        }
    }
}

/// Where device credentials come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CredentialMode {
    /// Credentials bound to the device.
    #[default]
    Device,
    /// Credentials bound to the user who started the run.
    User,
    /// Templated credentials rendered through the expression evaluator.
    Custom {
        /// Username template.
        username: String,
        /// Secret template.
        secret: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Notification settings, applied when a top-level run finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPolicy {
    /// Send a notification at all.
    pub send: bool,
    /// Transport channel name (e.g. `"webhook"`, `"chat"`).
    pub channel: String,
    /// Channel-specific destination (address, room, URL suffix).
    pub destination: Option<String>,
    /// Only notify when the run failed.
    pub only_on_failure: bool,
    /// Include the per-device breakdown in the message.
    pub include_device_results: bool,
    /// Attach the full results as JSON.
    pub attach_results: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Serde helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Serializes a [`Duration`] as fractional seconds.
///
/// Use with `#[serde(with = "armada_workflow::policy::duration_secs")]`.
pub mod duration_secs {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes the duration as seconds.
    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Reads seconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_condition_applies() {
        assert!(!ValidationCondition::Never.applies(true));
        assert!(ValidationCondition::Success.applies(true));
        assert!(!ValidationCondition::Success.applies(false));
        assert!(ValidationCondition::Failure.applies(false));
        assert!(ValidationCondition::Always.applies(false));
    }

    #[test]
    fn retry_policy_delay_round_trips_as_seconds() {
        let policy = RetryPolicy::new(2).with_delay(Duration::from_millis(1500));
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["delay"], 1.5);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back.delay, Duration::from_millis(1500));
    }

    #[test]
    fn validation_method_is_tagged() {
        let method: ValidationMethod = serde_json::from_str(
            r#"{"method": "text", "content": "up", "regex": false}"#,
        )
        .unwrap();
        assert_eq!(
            method,
            ValidationMethod::Text {
                content: "up".into(),
                regex: false,
                strip: false
            }
        );
    }

    #[test]
    fn run_mode_uses_kebab_case() {
        let mode: RunMode = serde_json::from_str("\"per-device-parallel\"").unwrap();
        assert_eq!(mode, RunMode::PerDeviceParallel);
    }
}
