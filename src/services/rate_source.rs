//! Rate source contracts
//!
//! The orchestrator only sees these traits; the on-chain vault reader and the
//! CoW quote client implement them, and [`StaticRateSource`] stands in for
//! both in simulations and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source not configured: {0}")]
    NotConfigured(String),

    #[error("invalid source input: {0}")]
    InvalidInput(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("quote API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Official exchange rate observation
#[derive(Debug, Clone, PartialEq)]
pub struct OfficialReading {
    /// Underlying per share
    pub rate: Decimal,
    /// Chain height the rate was read at; 0 when unknown
    pub block_number: u64,
}

/// Executable market quote for the configured notional
#[derive(Debug, Clone, PartialEq)]
pub struct MarketQuote {
    pub rate: Decimal,
    pub raw_quote: Value,
    pub quality: String,
}

#[async_trait]
pub trait OfficialRateSource: Send + Sync {
    async fn fetch_official(&self) -> Result<OfficialReading, SourceError>;
}

#[async_trait]
pub trait MarketRateSource: Send + Sync {
    async fn fetch_market(&self, notional: Decimal) -> Result<MarketQuote, SourceError>;
}

#[async_trait]
impl<T: OfficialRateSource + ?Sized> OfficialRateSource for Arc<T> {
    async fn fetch_official(&self) -> Result<OfficialReading, SourceError> {
        (**self).fetch_official().await
    }
}

#[async_trait]
impl<T: MarketRateSource + ?Sized> MarketRateSource for Arc<T> {
    async fn fetch_market(&self, notional: Decimal) -> Result<MarketQuote, SourceError> {
        (**self).fetch_market(notional).await
    }
}

/// Fixed official and market rates
#[derive(Debug, Clone)]
pub struct StaticRateSource {
    official: Decimal,
    market: Decimal,
    quality: String,
}

impl StaticRateSource {
    pub const QUALITY: &'static str = "simulated";

    pub fn new(official: Decimal, market: Decimal) -> Self {
        Self {
            official,
            market,
            quality: Self::QUALITY.to_string(),
        }
    }
}

#[async_trait]
impl OfficialRateSource for StaticRateSource {
    async fn fetch_official(&self) -> Result<OfficialReading, SourceError> {
        Ok(OfficialReading {
            rate: self.official,
            block_number: 0,
        })
    }
}

#[async_trait]
impl MarketRateSource for StaticRateSource {
    async fn fetch_market(&self, _notional: Decimal) -> Result<MarketQuote, SourceError> {
        Ok(MarketQuote {
            rate: self.market,
            raw_quote: Value::Object(Default::default()),
            quality: self.quality.clone(),
        })
    }
}
