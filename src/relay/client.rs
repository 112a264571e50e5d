use anyhow::{Context, Result};
use tracing::debug;

use super::{ChatReply, ChatRequest, ErrorBody, CHAT_PATH};

/// Talks to the relay the same way the browser page does.
#[derive(Clone, Debug)]
pub struct RelayClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RelayClient {
    pub fn new(relay_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build relay HTTP client")?;

        Ok(Self {
            http,
            endpoint: format!("{}{}", relay_url.trim_end_matches('/'), CHAT_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends one buffered request and returns the `prediction` field, if any.
    pub async fn send(&self, text: &str) -> Result<Option<String>> {
        let request = ChatRequest {
            text: Some(text.to_string()),
            stream: None,
        };

        debug!("-> Sending to relay: {} chars", text.len());

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("Relay is unreachable")?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) if !body.error.is_empty() => body.error,
                _ => format!("HTTP error! status: {}", status.as_u16()),
            };
            anyhow::bail!(message);
        }

        let reply: ChatReply = response
            .json()
            .await
            .context("Relay returned malformed JSON")?;

        Ok(reply.prediction)
    }
}
