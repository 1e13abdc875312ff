//! Chat incoming-webhook transport (Slack and Mattermost compatible).

use async_trait::async_trait;
use serde::Serialize;

use armada_runtime::error::NotifyError;
use armada_runtime::notify::{Notification, Notifier};

use crate::client::HookClient;

/// The message posted to the chat webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Markdown text.
    pub text: String,
    /// Room override; the webhook's own room is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Display name of the poster.
    pub username: String,
    /// Status emoji.
    pub icon_emoji: &'static str,
}

impl ChatMessage {
    /// Formats a notification as a chat message. Attachments are not posted;
    /// the message says when one was produced.
    #[must_use]
    pub fn from_notification(notification: &Notification, username: &str) -> Self {
        let mut text = format!("*{}*\n```\n{}```", notification.subject, notification.body);
        if notification.attachment.is_some() {
            text.push_str("\n_Full results are stored with the run._");
        }
        Self {
            text,
            channel: notification.destination.clone(),
            username: username.to_owned(),
            icon_emoji: if notification.success {
                ":white_check_mark:"
            } else {
                ":x:"
            },
        }
    }
}

/// Posts notifications to a chat incoming webhook. A notification's
/// destination selects the room.
#[derive(Debug, Clone)]
pub struct ChatNotifier {
    channel: String,
    webhook_url: String,
    username: String,
    client: HookClient,
}

impl ChatNotifier {
    /// Creates a notifier serving `channel` that posts to `webhook_url`.
    #[must_use]
    pub fn new(channel: impl Into<String>, webhook_url: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            webhook_url: webhook_url.into(),
            username: "armada".to_owned(),
            client: HookClient::new(None),
        }
    }

    /// Reads the webhook URL from an environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::MissingDestination`] if the variable is unset.
    pub fn from_env(channel: impl Into<String>, var: &str) -> Result<Self, NotifyError> {
        let channel = channel.into();
        let url = std::env::var(var).map_err(|_| NotifyError::MissingDestination(channel.clone()))?;
        Ok(Self::new(channel, url))
    }

    /// Sets the poster's display name.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = ChatMessage::from_notification(notification, &self.username);
        tracing::debug!(channel = %self.channel, room = ?message.channel, "posting chat notification");
        self.client.post(&self.webhook_url, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_runtime::result::RuntimeId;
    use serde_json::json;

    fn notification(success: bool) -> Notification {
        Notification {
            channel: "chat".into(),
            destination: Some("#netops".into()),
            subject: "[armada] backup PASS".into(),
            body: "Service: backup\nResult: PASS\n".into(),
            attachment: None,
            success,
            runtime: RuntimeId::from_string("rt-3"),
            service: "backup".into(),
        }
    }

    #[test]
    fn formats_subject_and_body() {
        let message = ChatMessage::from_notification(&notification(true), "armada");
        assert_eq!(
            message.text,
            "*[armada] backup PASS*\n```\nService: backup\nResult: PASS\n```"
        );
        assert_eq!(message.channel.as_deref(), Some("#netops"));
        assert_eq!(message.icon_emoji, ":white_check_mark:");
    }

    #[test]
    fn failed_runs_use_the_failure_icon() {
        let mut failed = notification(false);
        failed.attachment = Some(json!({}));
        let message = ChatMessage::from_notification(&failed, "bot");
        assert_eq!(message.icon_emoji, ":x:");
        assert_eq!(message.username, "bot");
        assert!(message.text.ends_with("_Full results are stored with the run._"));
    }

    #[test]
    fn room_is_omitted_without_destination() {
        let mut untargeted = notification(true);
        untargeted.destination = None;
        let value = serde_json::to_value(ChatMessage::from_notification(&untargeted, "armada")).unwrap();
        assert!(value.get("channel").is_none());
    }
}
