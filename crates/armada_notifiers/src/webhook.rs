//! Generic JSON webhook transport.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use armada_runtime::error::NotifyError;
use armada_runtime::notify::{Notification, Notifier};

use crate::client::HookClient;

/// Results attached to a webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    /// Suggested file name.
    pub filename: String,
    /// Always `application/json`.
    pub content_type: &'static str,
    /// Base64 of the JSON results.
    pub data: String,
}

/// The document posted for each notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload<'a> {
    /// Root service name.
    pub service: &'a str,
    /// Run lineage.
    pub runtime: &'a str,
    /// Overall success.
    pub success: bool,
    /// One-line subject.
    pub subject: &'a str,
    /// Plain-text summary.
    pub body: &'a str,
    /// Encoded results, when the service asked for them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl<'a> WebhookPayload<'a> {
    /// Builds the payload for a notification.
    #[must_use]
    pub fn from_notification(notification: &'a Notification) -> Self {
        let attachment = notification.attachment.as_ref().map(|results| Attachment {
            filename: format!("results-{}.json", notification.runtime),
            content_type: "application/json",
            data: STANDARD.encode(results.to_string()),
        });
        Self {
            service: &notification.service,
            runtime: notification.runtime.as_str(),
            success: notification.success,
            subject: &notification.subject,
            body: &notification.body,
            attachment,
        }
    }
}

/// Posts notifications as JSON to an HTTP endpoint.
///
/// The notification's destination is used as the URL; the configured default
/// URL applies when the service names none.
///
/// ```no_run
/// use armada_notifiers::WebhookNotifier;
///
/// let notifier = WebhookNotifier::new("ops-hook")
///     .with_default_url("https://hooks.example.net/armada")
///     .with_token("s3cret");
/// ```
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    channel: String,
    default_url: Option<String>,
    client: HookClient,
}

impl WebhookNotifier {
    /// Creates a notifier serving `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            default_url: None,
            client: HookClient::new(None),
        }
    }

    /// Sets the URL used when a notification has no destination.
    #[must_use]
    pub fn with_default_url(mut self, url: impl Into<String>) -> Self {
        self.default_url = Some(url.into());
        self
    }

    /// Sends a bearer token with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.client = HookClient::new(Some(token.into()));
        self
    }

    fn url<'n>(&'n self, notification: &'n Notification) -> Result<&'n str, NotifyError> {
        notification
            .destination
            .as_deref()
            .or(self.default_url.as_deref())
            .ok_or_else(|| NotifyError::MissingDestination(self.channel.clone()))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let url = self.url(notification)?;
        let payload = WebhookPayload::from_notification(notification);
        tracing::debug!(channel = %self.channel, %url, "posting webhook notification");
        self.client.post(url, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_runtime::result::RuntimeId;
    use serde_json::json;

    fn notification(attachment: Option<serde_json::Value>) -> Notification {
        Notification {
            channel: "ops-hook".into(),
            destination: None,
            subject: "[armada] backup FAIL".into(),
            body: "Service: backup\n".into(),
            attachment,
            success: false,
            runtime: RuntimeId::from_string("rt-7"),
            service: "backup".into(),
        }
    }

    #[test]
    fn payload_encodes_attachment() {
        let notification = notification(Some(json!({"success": false})));
        let payload = WebhookPayload::from_notification(&notification);
        let attachment = payload.attachment.as_ref().unwrap();
        assert_eq!(attachment.filename, "results-rt-7.json");
        assert_eq!(
            STANDARD.decode(&attachment.data).unwrap(),
            br#"{"success":false}"#
        );

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["runtime"], "rt-7");
        assert_eq!(value["success"], false);
    }

    #[test]
    fn payload_omits_missing_attachment() {
        let notification = notification(None);
        let value = serde_json::to_value(WebhookPayload::from_notification(&notification)).unwrap();
        assert!(value.get("attachment").is_none());
    }

    #[test]
    fn destination_wins_over_default_url() {
        let notifier = WebhookNotifier::new("ops-hook").with_default_url("https://default.test");
        let mut targeted = notification(None);
        targeted.destination = Some("https://team.test".into());
        assert_eq!(notifier.url(&targeted).unwrap(), "https://team.test");
        assert_eq!(notifier.url(&notification(None)).unwrap(), "https://default.test");
    }

    #[tokio::test]
    async fn missing_destination_fails_before_sending() {
        let notifier = WebhookNotifier::new("ops-hook");
        let err = notifier.send(&notification(None)).await.unwrap_err();
        assert!(matches!(err, NotifyError::MissingDestination(channel) if channel == "ops-hook"));
    }

    #[test]
    fn debug_redacts_token() {
        let notifier = WebhookNotifier::new("ops-hook").with_token("s3cret");
        assert!(!format!("{notifier:?}").contains("s3cret"));
    }
}
