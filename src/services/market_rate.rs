//! Market rate source
//!
//! Requests a sell quote from the CoW Protocol API for the configured USDe
//! notional and reports sUSDe received per USDe sold.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::CowConfig;
use crate::services::rate_source::{MarketQuote, MarketRateSource, SourceError};

const QUOTE_PATH: &str = "/quote";
const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";
const APP_ID: &str = "depeg-watch";
const APP_DATA: &str = r#"{"version":"0.7.0","appCode":"depeg-watch","metadata":{}}"#;

/// Quotes must stay valid this long
const QUOTE_VALIDITY_SECS: i64 = 5 * 60;

const ATOMS_PER_TOKEN: Decimal = dec!(1_000_000_000_000_000_000);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuoteRequest<'a> {
    sell_token: &'a str,
    buy_token: &'a str,
    kind: &'static str,
    from: &'static str,
    app_data: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    price_quality: &'a str,
    sell_amount_before_fee: String,
    valid_to: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    quote: QuoteBody,
    #[serde(default)]
    price_quality: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteBody {
    buy_amount: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    message: String,
}

#[derive(Clone)]
pub struct CowMarketRate {
    client: Client,
    base_url: String,
    price_quality: String,
    user_agent: String,
    sell_token: String,
    buy_token: String,
}

impl CowMarketRate {
    /// Create the quote client
    ///
    /// # Arguments
    ///
    /// * `config` - CoW API settings
    /// * `sell_token` - USDe address
    /// * `buy_token` - sUSDe address
    pub fn new(
        config: &CowConfig,
        sell_token: Option<&str>,
        buy_token: Option<&str>,
    ) -> Result<Self, SourceError> {
        let (sell_token, buy_token) = match (sell_token, buy_token) {
            (Some(sell), Some(buy)) if !sell.trim().is_empty() && !buy.trim().is_empty() => {
                (sell.trim().to_string(), buy.trim().to_string())
            }
            _ => {
                return Err(SourceError::NotConfigured(
                    "sellToken and buyToken addresses required".to_string(),
                ));
            }
        };

        let request_timeout = if config.request_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            config.request_timeout
        };
        let client = Client::builder().timeout(request_timeout).build()?;

        let base_url = config.base_url.trim_end_matches('/');
        let base_url = if base_url.is_empty() {
            crate::config::DEFAULT_COW_BASE_URL.to_string()
        } else {
            base_url.to_string()
        };

        let user_agent = if config.user_agent.trim().is_empty() {
            crate::config::DEFAULT_USER_AGENT.to_string()
        } else {
            config.user_agent.trim().to_string()
        };

        Ok(Self {
            client,
            base_url,
            price_quality: config.price_quality.clone(),
            user_agent,
            sell_token,
            buy_token,
        })
    }
}

#[async_trait]
impl MarketRateSource for CowMarketRate {
    async fn fetch_market(&self, notional: Decimal) -> Result<MarketQuote, SourceError> {
        let sell_atoms = sell_amount_atoms(notional)?;

        let request = QuoteRequest {
            sell_token: &self.sell_token,
            buy_token: &self.buy_token,
            kind: "sell",
            from: ZERO_ADDRESS,
            app_data: APP_DATA,
            price_quality: &self.price_quality,
            sell_amount_before_fee: sell_atoms.to_string(),
            valid_to: Utc::now().timestamp() + QUOTE_VALIDITY_SECS,
        };

        let url = format!("{}{}", self.base_url, QUOTE_PATH);
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("X-AppId", APP_ID)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let payload = response.bytes().await?;

        if status != StatusCode::OK {
            return Err(api_error(status, &payload));
        }

        let raw_quote: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| SourceError::InvalidResponse(format!("quote is not JSON: {}", e)))?;
        let parsed: QuoteResponse = serde_json::from_value(raw_quote.clone())
            .map_err(|e| SourceError::InvalidResponse(format!("unexpected quote shape: {}", e)))?;

        let rate = quote_rate(&parsed.quote.buy_amount, sell_atoms)?;
        let quality = parsed
            .price_quality
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| self.price_quality.clone());

        debug!(rate = %rate, quality = %quality, "Received market quote");

        Ok(MarketQuote {
            rate,
            raw_quote,
            quality,
        })
    }
}

/// `notional * 10^18`, rounded to whole atoms
fn sell_amount_atoms(notional: Decimal) -> Result<Decimal, SourceError> {
    if notional <= Decimal::ZERO {
        return Err(SourceError::InvalidInput(
            "notional must be greater than zero".to_string(),
        ));
    }
    let atoms = notional
        .checked_mul(ATOMS_PER_TOKEN)
        .ok_or_else(|| SourceError::InvalidInput(format!("notional {} too large", notional)))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    if atoms.is_zero() {
        return Err(SourceError::InvalidInput(
            "sell amount rounded to zero".to_string(),
        ));
    }
    Ok(atoms)
}

fn quote_rate(buy_amount: &str, sell_atoms: Decimal) -> Result<Decimal, SourceError> {
    let buy_atoms = Decimal::from_str(buy_amount.trim()).map_err(|e| {
        SourceError::InvalidResponse(format!("parse buy amount '{}': {}", buy_amount, e))
    })?;
    if buy_atoms.is_zero() {
        return Err(SourceError::InvalidResponse(
            "buy amount returned zero".to_string(),
        ));
    }
    buy_atoms
        .checked_div(sell_atoms)
        .ok_or_else(|| SourceError::InvalidResponse("rate out of range".to_string()))
}

fn api_error(status: StatusCode, payload: &[u8]) -> SourceError {
    let body: ApiErrorBody = serde_json::from_slice(payload).unwrap_or_default();
    let message = [body.description, body.message, body.error_type]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| String::from_utf8_lossy(payload).trim().to_string());

    SourceError::Api {
        status: status.as_u16(),
        message,
    }
}
