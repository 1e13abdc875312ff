//! Notification transports for Armada.
//!
//! Each transport implements [`Notifier`](armada_runtime::notify::Notifier)
//! and is registered with the engine under a channel name that services
//! reference in their notification policy.
//!
//! | Transport | Feature Flag | Description |
//! |-----------|--------------|-------------|
//! | [`WebhookNotifier`] | `webhook` (default) | JSON document with a base64 results attachment |
//! | [`ChatNotifier`] | `chat` (default) | Slack/Mattermost incoming webhook |
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use armada_notifiers::{ChatNotifier, WebhookNotifier};
//! use armada_runtime::Engine;
//!
//! let engine = Engine::builder()
//!     .with_notifier(Arc::new(WebhookNotifier::new("webhook").with_token("s3cret")))
//!     .with_notifier(Arc::new(ChatNotifier::new("chat", "https://chat.example.net/hooks/abc")))
//!     .build()
//!     .unwrap();
//! ```

#[cfg(any(feature = "webhook", feature = "chat"))]
mod client;

/// Chat incoming-webhook transport.
#[cfg(feature = "chat")]
pub mod chat;

/// Generic JSON webhook transport.
#[cfg(feature = "webhook")]
pub mod webhook;

#[cfg(feature = "chat")]
pub use chat::{ChatMessage, ChatNotifier};
#[cfg(feature = "webhook")]
pub use webhook::{Attachment, WebhookNotifier, WebhookPayload};
