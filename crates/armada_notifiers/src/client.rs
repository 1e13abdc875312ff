//! Shared HTTP client for webhook-style transports.

use armada_runtime::error::NotifyError;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;

/// Posts JSON documents to webhook endpoints.
#[derive(Clone)]
pub(crate) struct HookClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl HookClient {
    pub(crate) fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Posts `body` to `url`. Any non-2xx status is a transport failure.
    pub(crate) async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<(), NotifyError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| NotifyError::Transport(format!("invalid token header: {err}")))?,
            );
        }

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(NotifyError::Transport(format!(
            "{url} answered {}: {text}",
            status.as_u16()
        )))
    }
}

impl core::fmt::Debug for HookClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookClient")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
