//! Alert notifier
//!
//! Delivers deviation alerts. Telegram is the only concrete channel; the
//! orchestrator depends on the [`Notifier`] trait so tests can capture
//! notifications instead.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::info;

use crate::config::TelegramConfig;
use crate::models::AlertDirection;

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier not configured: {0}")]
    NotConfigured(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram responded with status {0}")]
    Status(u16),

    #[error("telegram rejected the message")]
    Rejected,
}

/// Everything needed to describe one alert to a human
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub bucket: DateTime<Utc>,
    pub official_rate: Decimal,
    pub market_rate: Decimal,
    pub deviation_pct: Decimal,
    pub threshold_pct: Decimal,
    pub direction: AlertDirection,
    pub channels: Vec<String>,
    pub notional: Decimal,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
}

#[derive(Deserialize)]
struct SendMessageResponse {
    ok: bool,
}

pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let bot_token = config
            .bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| NotifyError::NotConfigured("telegram bot token".to_string()))?;
        let chat_id = config
            .chat_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| NotifyError::NotConfigured("telegram chat id".to_string()))?;

        let api_base = match config.api_base.trim_end_matches('/') {
            "" => crate::config::DEFAULT_TELEGRAM_API_BASE.to_string(),
            base => base.to_string(),
        };

        Ok(Self {
            client: Client::builder().timeout(TELEGRAM_TIMEOUT).build()?,
            api_base,
            bot_token,
            chat_id,
        })
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.send_message_url())
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text: render_message(notification),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }

        // An unparseable body on a 2xx is treated as delivered
        if let Ok(body) = response.json::<SendMessageResponse>().await {
            if !body.ok {
                return Err(NotifyError::Rejected);
            }
        }

        info!(
            bucket = %notification.bucket,
            direction = %notification.direction,
            channels = %notification.channels.join(","),
            "Alert sent via Telegram"
        );
        Ok(())
    }
}

fn fixed3(value: Decimal) -> String {
    format!(
        "{:.3}",
        value.round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero)
    )
}

/// Plain-text alert body
pub fn render_message(notification: &Notification) -> String {
    let mut text = String::from("[USDe-sUSDe Alert]\n");
    let _ = writeln!(
        text,
        "Bucket: {} UTC",
        notification.bucket.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    let _ = writeln!(text, "Official: {} sUSDe/USDe", fixed3(notification.official_rate));
    let _ = writeln!(text, "Market: {} sUSDe/USDe", fixed3(notification.market_rate));
    let _ = writeln!(
        text,
        "Deviation: {}% (threshold {}%)",
        fixed3(notification.deviation_pct),
        fixed3(notification.threshold_pct)
    );
    let _ = writeln!(text, "Direction: {}", notification.direction);
    let _ = writeln!(text, "Notional: {} USDe", notification.notional.normalize());
    if !notification.channels.is_empty() {
        let _ = writeln!(text, "Channels: {}", notification.channels.join(","));
    }
    text
}
