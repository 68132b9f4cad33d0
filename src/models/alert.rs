use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side of the deviation relative to the official rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Up,
    Down,
    Flat,
}

impl AlertDirection {
    /// Classify a signed deviation
    pub fn classify(deviation_pct: Decimal) -> Self {
        if deviation_pct.is_zero() {
            AlertDirection::Flat
        } else if deviation_pct.is_sign_positive() {
            AlertDirection::Up
        } else {
            AlertDirection::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertDirection::Up => "up",
            AlertDirection::Down => "down",
            AlertDirection::Flat => "flat",
        }
    }
}

impl fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(AlertDirection::Up),
            "down" => Ok(AlertDirection::Down),
            "flat" => Ok(AlertDirection::Flat),
            other => Err(format!("unknown alert direction '{}'", other)),
        }
    }
}

/// Alert to be written for a sample bucket (the store assigns id/created_at)
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub sample_bucket: DateTime<Utc>,
    pub deviation_pct: Decimal,
    pub threshold_pct: Decimal,
    pub direction: AlertDirection,
    pub channels: Vec<String>,
}

/// Alert as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub sample_bucket: DateTime<Utc>,
    pub deviation_pct: Decimal,
    pub threshold_pct: Decimal,
    pub direction: AlertDirection,
    pub channels: Vec<String>,
    pub created_at: DateTime<Utc>,
}
