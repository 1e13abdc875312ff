//! Run notifications.
//!
//! When a top-level run finishes, its service's [`NotificationPolicy`] decides
//! whether a summary is rendered and on which channel it goes out. Transports
//! implement [`Notifier`]; their failures are logged and never fail the run.
//!
//! [`NotificationPolicy`]: armada_workflow::policy::NotificationPolicy

use core::fmt;
use core::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use armada_workflow::Service;

use crate::error::NotifyError;
use crate::result::{RunReport, RuntimeId};

/// A rendered run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Transport channel.
    pub channel: String,
    /// Channel-specific destination.
    pub destination: Option<String>,
    /// One-line subject.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Full results, when the policy asks for them.
    pub attachment: Option<Value>,
    /// Overall success of the run.
    pub success: bool,
    /// Run lineage.
    pub runtime: RuntimeId,
    /// Root service name.
    pub service: String,
}

/// A notification transport.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Channel name services reference.
    fn channel(&self) -> &str;

    /// Delivers a notification.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Registry of notifiers by channel.
#[derive(Default, Clone)]
pub struct NotifierRegistry {
    notifiers: IndexMap<String, Arc<dyn Notifier>>,
}

impl fmt::Debug for NotifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierRegistry")
            .field("channels", &self.names())
            .finish()
    }
}

impl NotifierRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a notifier under its channel, returning the one it replaced.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) -> Option<Arc<dyn Notifier>> {
        self.notifiers.insert(notifier.channel().to_owned(), notifier)
    }

    /// Looks a notifier up.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<Arc<dyn Notifier>> {
        self.notifiers.get(channel).cloned()
    }

    /// Returns true if a notifier serves the channel.
    #[must_use]
    pub fn has(&self, channel: &str) -> bool {
        self.notifiers.contains_key(channel)
    }

    /// Returns the registered channels.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.notifiers.keys().map(String::as_str).collect()
    }

    /// Sends `notification` on its channel.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::UnknownChannel`] if nothing serves the channel,
    /// or the transport's error.
    pub async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let notifier = self
            .get(&notification.channel)
            .ok_or_else(|| NotifyError::UnknownChannel(notification.channel.clone()))?;
        notifier.send(notification).await
    }
}

/// Renders the notification for a finished run, or `None` if the service's
/// policy does not ask for one.
#[must_use]
pub fn render(service: &Service, report: &RunReport) -> Option<Notification> {
    let policy = &service.notification;
    if !policy.send || (policy.only_on_failure && report.success) {
        return None;
    }

    let verdict = if report.success { "PASS" } else { "FAIL" };
    let result = &report.result;
    let mut body = format!(
        "Service: {}\nRuntime: {}\nStatus: {}\nResult: {verdict}\n",
        service.name, report.runtime, report.status
    );
    if let Some(error) = &result.error {
        let _ = writeln!(body, "Error: {error}");
    }
    if policy.include_device_results && !result.devices.is_empty() {
        let summary = &result.summary;
        let _ = writeln!(
            body,
            "\nPassed: {}  Failed: {}  Discarded: {}  Aborted: {}",
            summary.success.len(),
            summary.failure.len(),
            summary.discarded.len(),
            summary.aborted.len()
        );
        for outcome in result.devices.values() {
            let name = outcome.device_name.as_deref().unwrap_or("?");
            match (&outcome.error, outcome.success) {
                (_, true) => {
                    let _ = writeln!(body, "  - {name}: success");
                }
                (Some(error), false) => {
                    let _ = writeln!(body, "  - {name}: failure ({error})");
                }
                (None, false) => {
                    let _ = writeln!(body, "  - {name}: failure");
                }
            }
        }
    }

    Some(Notification {
        channel: policy.channel.clone(),
        destination: policy.destination.clone(),
        subject: format!("[armada] {} {verdict}", service.name),
        body,
        attachment: policy
            .attach_results
            .then(|| serde_json::to_value(result).unwrap_or(Value::Null)),
        success: report.success,
        runtime: report.runtime.clone(),
        service: service.name.clone(),
    })
}

/// Renders and sends the notification for a finished run. Failures are
/// logged.
pub(crate) async fn dispatch(registry: &NotifierRegistry, service: &Service, report: &RunReport) {
    let Some(notification) = render(service, report) else {
        return;
    };
    match registry.send(&notification).await {
        Ok(()) => tracing::info!(channel = %notification.channel, "notification sent"),
        Err(err) => tracing::warn!(
            channel = %notification.channel,
            error = %err,
            "notification failed"
        ),
    }
}

/// Writes notifications to the log. Registered under the `log` channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            runtime = %notification.runtime,
            subject = %notification.subject,
            "{}",
            notification.body
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_workflow::Device;
    use armada_workflow::policy::NotificationPolicy;

    use crate::result::{RunResult, RunStatus, StepResult};

    fn report(success: bool) -> RunReport {
        let runtime = RuntimeId::from_string("rt-1");
        let mut result = RunResult::new(runtime.clone(), "backup", "backup");
        let r1 = Device::new(1, "r1", "10.0.0.1", "ssh");
        let r2 = Device::new(2, "r2", "10.0.0.2", "ssh");
        let mut ok = StepResult::new("backup", Some(&r1));
        ok.success = true;
        result.insert(ok);
        if !success {
            result.insert(StepResult::failed("backup", Some(&r2), "timeout"));
        }
        result.aggregate();
        RunReport {
            runtime,
            status: RunStatus::Completed,
            success: result.success,
            result,
        }
    }

    fn service(policy: NotificationPolicy) -> Service {
        Service::atomic(1, "backup", "command").with_notification(policy)
    }

    fn policy() -> NotificationPolicy {
        NotificationPolicy {
            send: true,
            channel: "log".into(),
            include_device_results: true,
            ..NotificationPolicy::default()
        }
    }

    #[test]
    fn renders_breakdown() {
        let notification = render(&service(policy()), &report(false)).unwrap();
        assert_eq!(notification.subject, "[armada] backup FAIL");
        assert!(notification.body.contains("Runtime: rt-1"));
        assert!(notification.body.contains("  - r1: success"));
        assert!(notification.body.contains("  - r2: failure (timeout)"));
        assert!(notification.attachment.is_none());
    }

    #[test]
    fn only_on_failure_suppresses_passing_runs() {
        let policy = NotificationPolicy {
            only_on_failure: true,
            ..policy()
        };
        assert!(render(&service(policy.clone()), &report(true)).is_none());
        assert!(render(&service(policy), &report(false)).is_some());
    }

    #[test]
    fn disabled_policy_renders_nothing() {
        assert!(render(&service(NotificationPolicy::default()), &report(false)).is_none());
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let registry = NotifierRegistry::new();
        let notification = render(&service(policy()), &report(true)).unwrap();
        let err = registry.send(&notification).await.unwrap_err();
        assert!(matches!(err, NotifyError::UnknownChannel(channel) if channel == "log"));
    }
}
