// Outbound messaging: Telegram Bot API adapter behind the Messenger seam
//
// send() is fire-and-forget for the caller but completes before returning;
// the client-level timeout keeps a slow send from stalling an ingest shard.

use crate::config::HTTP_TIMEOUT;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SendError {
    /// The recipient blocked the bot (403-class). The caller disables the
    /// subscriber; no retry.
    #[error("recipient blocked the bot")]
    Blocked,
    /// Anything else: logged and dropped, never retried.
    #[error("send failed: {0}")]
    Transport(String),
}

/// Outbound send contract. Production uses the Telegram adapter; tests use
/// a recording implementation.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError>;
}

pub struct Telegram {
    http: reqwest::Client,
    send_url: String,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

impl Telegram {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build telegram HTTP client")?;
        Ok(Self {
            http,
            send_url: format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
        })
    }
}

#[async_trait]
impl Messenger for Telegram {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SendError> {
        let body = SendMessageBody {
            chat_id,
            text,
            parse_mode: "Markdown",
            disable_web_page_preview: true,
        };
        let resp = self
            .http
            .post(&self.send_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(chat_id, "message delivered");
            return Ok(());
        }
        if status == StatusCode::FORBIDDEN {
            return Err(SendError::Blocked);
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(SendError::Transport(format!("{status} {detail}")))
    }
}
