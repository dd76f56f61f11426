//! Slack reply channel via the Web API `chat.postMessage` method.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::channels::ReplySender;
use crate::config::SlackConfig;
use crate::error::ChannelError;

/// Posts replies with a bot token.
pub struct SlackSender {
    config: SlackConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackSender {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.config.api_base.trim_end_matches('/'))
    }

    fn outbound_text(&self, text: &str) -> String {
        if self.config.bot_prefix.is_empty() {
            text.to_string()
        } else {
            format!("{} {text}", self.config.bot_prefix)
        }
    }
}

#[async_trait]
impl ReplySender for SlackSender {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({
            "channel": channel,
            "text": self.outbound_text(text),
        });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = serde_json::Value::String(ts.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(self.config.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: "slack".into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Http(format!(
                "chat.postMessage returned {status}: {detail}"
            )));
        }

        // Slack reports most failures as 200 with ok=false.
        let parsed: PostMessageResponse = resp.json().await.map_err(|e| ChannelError::SendFailed {
            name: "slack".into(),
            reason: format!("unreadable response: {e}"),
        })?;
        if !parsed.ok {
            return Err(ChannelError::SendFailed {
                name: "slack".into(),
                reason: parsed.error.unwrap_or_else(|| "unknown error".into()),
            });
        }

        tracing::debug!(channel, thread_ts = ?thread_ts, "Slack reply posted");
        Ok(())
    }
}
