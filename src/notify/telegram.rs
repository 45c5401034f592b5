//! Telegram Bot API notifier.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Notification, Notifier};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Telegram rejects messages above 4096 characters.
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub channel_id: String,
}

impl TelegramConfig {
    /// Read TELEGRAM_BOT_TOKEN and TELEGRAM_CHANNEL_ID; `None` if either
    /// is unset or empty.
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let channel_id = std::env::var("TELEGRAM_CHANNEL_ID").ok()?;
        if bot_token.trim().is_empty() || channel_id.trim().is_empty() {
            return None;
        }
        Some(Self {
            bot_token,
            channel_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    config: TelegramConfig,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: TELEGRAM_API_BASE.to_string(),
            config,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.config.bot_token, method)
    }

    /// Verify the token with `getMe`.
    pub async fn test_connection(&self) -> Result<()> {
        let response = self
            .client
            .get(self.method_url("getMe"))
            .send()
            .await
            .context("Telegram getMe request failed")?;
        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .context("Failed to parse getMe response")?;
        if !status.is_success() || !body.ok {
            bail!(
                "Telegram getMe failed ({}): {}",
                status,
                body.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn send_message(&self, text: String) -> Result<()> {
        let payload = json!({
            "chat_id": self.config.channel_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await
            .context("Telegram sendMessage request failed")?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .context("Failed to parse sendMessage response")?;
        if !status.is_success() || !body.ok {
            bail!(
                "Telegram sendMessage failed ({}): {}",
                status,
                body.description.unwrap_or_default()
            );
        }
        debug!("Telegram message sent");
        Ok(())
    }
}

/// Render a notification as Telegram HTML.
pub(crate) fn render(notification: &Notification) -> String {
    let body = escape_html(&notification.message);
    let body = if body.chars().count() > MAX_MESSAGE_CHARS {
        let cut: String = body.chars().take(MAX_MESSAGE_CHARS).collect();
        format!("{}...", cut)
    } else {
        body
    };
    format!(
        "{} <b>{}</b>\n\n{}",
        notification.kind.emoji(),
        notification.kind,
        body
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

impl Notifier for TelegramNotifier {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.send_message(render(notification)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;

    #[test]
    fn test_render_escapes_and_labels() {
        let n = Notification::new(NotificationKind::Critical, "stop <fixed> & trailing missing");
        let text = render(&n);
        assert!(text.starts_with("🚨 <b>CRITICAL</b>"));
        assert!(text.contains("stop &lt;fixed&gt; &amp; trailing missing"));
    }

    #[test]
    fn test_render_truncates_long_messages() {
        let n = Notification::new(NotificationKind::Info, "x".repeat(5000));
        let text = render(&n);
        assert!(text.ends_with("..."));
        assert!(text.chars().count() < 4100);
    }
}
