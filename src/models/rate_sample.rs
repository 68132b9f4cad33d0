use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome recorded for a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Complete,
    Errored,
}

impl SampleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleStatus::Complete => "complete",
            SampleStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for SampleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(SampleStatus::Complete),
            "errored" => Ok(SampleStatus::Errored),
            other => Err(format!("unknown sample status '{}'", other)),
        }
    }
}

/// One observation of official vs market rate for an aligned bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSample {
    pub bucket: DateTime<Utc>,
    pub official_rate: Decimal,
    pub market_rate: Decimal,
    /// Positive when the market trades above the official rate
    pub deviation_pct: Decimal,
    /// Reference trade size used to source the market quote
    pub notional: Decimal,
    pub quote_quality: String,
    pub raw_quote: serde_json::Value,
    pub block_number: Option<i64>,
    pub status: SampleStatus,
    /// Only present when `status` is `Errored`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
