//! Runtime configuration
//!
//! Everything is read from the process environment (a `.env` file is loaded
//! first by `dotenvy`). Invalid values are rejected up front so the sampling
//! loop never has to deal with configuration errors.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Default bucket interval in seconds (5 minutes)
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Default advisory lock key ("usDE" in ASCII)
pub const DEFAULT_ADVISORY_LOCK_KEY: i64 = 0x7573_4445;

pub const DEFAULT_COW_BASE_URL: &str = "https://api.cow.fi/mainnet/api/v1";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_USER_AGENT: &str = "depeg-watch/1.0";

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_DATABASE_MAX_CONNECTIONS: &str = "DATABASE_MAX_CONNECTIONS";
const ENV_DATABASE_MIN_CONNECTIONS: &str = "DATABASE_MIN_CONNECTIONS";
const ENV_DATABASE_RUN_MIGRATIONS: &str = "DATABASE_RUN_MIGRATIONS";

const ENV_SCHEDULER_INTERVAL: &str = "SCHEDULER_INTERVAL_SECS";
const ENV_SCHEDULER_ALIGN: &str = "SCHEDULER_ALIGN_TO_BUCKET";
const ENV_SCHEDULER_LOCK_KEY: &str = "SCHEDULER_ADVISORY_LOCK_KEY";
const ENV_SCHEDULER_STARTUP_DELAY: &str = "SCHEDULER_STARTUP_DELAY_SECS";

const ENV_ETH_RPC_URL: &str = "ETH_RPC_URL";
const ENV_SUSDE_ADDRESS: &str = "SUSDE_ADDRESS";
const ENV_USDE_ADDRESS: &str = "USDE_ADDRESS";
const ENV_ETH_REQUEST_TIMEOUT: &str = "ETH_REQUEST_TIMEOUT_SECS";

const ENV_COW_BASE_URL: &str = "COW_BASE_URL";
const ENV_COW_PRICE_QUALITY: &str = "COW_PRICE_QUALITY";
const ENV_COW_NOTIONAL: &str = "COW_NOTIONAL_USDE";
const ENV_COW_REQUEST_TIMEOUT: &str = "COW_REQUEST_TIMEOUT_SECS";
const ENV_COW_USER_AGENT: &str = "COW_USER_AGENT";

const ENV_ALERT_ENABLED: &str = "ALERT_ENABLED";
const ENV_ALERT_THRESHOLD: &str = "ALERT_THRESHOLD_PCT";
const ENV_ALERT_CHANNELS: &str = "ALERT_CHANNELS";

const ENV_TELEGRAM_ENABLED: &str = "TELEGRAM_ENABLED";
const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
const ENV_TELEGRAM_API_BASE: &str = "TELEGRAM_API_BASE";

const ENV_EXPORT_MAX_POINTS: &str = "EXPORT_MAX_DATA_POINTS";

const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{0}")]
    Constraint(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub ethereum: EthereumConfig,
    pub cow: CowConfig,
    pub alerting: AlertingConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Unset disables persistence for the live loop
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub align_to_bucket: bool,
    /// 0 disables the cross-instance gate
    pub advisory_lock_key: i64,
    pub startup_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct EthereumConfig {
    pub rpc_url: Option<String>,
    pub susde_address: Option<String>,
    pub usde_address: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CowConfig {
    pub base_url: String,
    pub price_quality: String,
    pub notional_usde: Decimal,
    pub request_timeout: Duration,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct AlertingConfig {
    pub enabled: bool,
    pub threshold_pct: Decimal,
    pub channels: Vec<String>,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub max_data_points: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an explicit key/value map
    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| values.get(key).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        let config = Config {
            database: DatabaseConfig {
                url: env.optional(ENV_DATABASE_URL),
                max_connections: env.parse_or(ENV_DATABASE_MAX_CONNECTIONS, 10)?,
                min_connections: env.parse_or(ENV_DATABASE_MIN_CONNECTIONS, 1)?,
                run_migrations: env.flag_or(ENV_DATABASE_RUN_MIGRATIONS, true)?,
            },
            scheduler: SchedulerConfig {
                interval: Duration::from_secs(
                    env.parse_or(ENV_SCHEDULER_INTERVAL, DEFAULT_INTERVAL_SECS)?,
                ),
                align_to_bucket: env.flag_or(ENV_SCHEDULER_ALIGN, true)?,
                advisory_lock_key: env.lock_key_or(ENV_SCHEDULER_LOCK_KEY, DEFAULT_ADVISORY_LOCK_KEY)?,
                startup_delay: Duration::from_secs(env.parse_or(ENV_SCHEDULER_STARTUP_DELAY, 0)?),
            },
            ethereum: EthereumConfig {
                rpc_url: env.optional(ENV_ETH_RPC_URL),
                susde_address: env.optional(ENV_SUSDE_ADDRESS),
                usde_address: env.optional(ENV_USDE_ADDRESS),
                request_timeout: Duration::from_secs(env.parse_or(ENV_ETH_REQUEST_TIMEOUT, 10)?),
            },
            cow: CowConfig {
                base_url: env
                    .optional(ENV_COW_BASE_URL)
                    .unwrap_or_else(|| DEFAULT_COW_BASE_URL.to_string()),
                price_quality: env
                    .optional(ENV_COW_PRICE_QUALITY)
                    .unwrap_or_else(|| "optimal".to_string()),
                notional_usde: env.parse_or(ENV_COW_NOTIONAL, Decimal::from(10_000))?,
                request_timeout: Duration::from_secs(env.parse_or(ENV_COW_REQUEST_TIMEOUT, 10)?),
                user_agent: env
                    .optional(ENV_COW_USER_AGENT)
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            },
            alerting: AlertingConfig {
                enabled: env.flag_or(ENV_ALERT_ENABLED, false)?,
                threshold_pct: env.parse_or(ENV_ALERT_THRESHOLD, Decimal::new(4, 1))?,
                channels: env
                    .optional(ENV_ALERT_CHANNELS)
                    .map(|raw| split_list(&raw))
                    .unwrap_or_else(|| vec!["telegram".to_string()]),
                telegram: TelegramConfig {
                    enabled: env.flag_or(ENV_TELEGRAM_ENABLED, false)?,
                    bot_token: env.optional(ENV_TELEGRAM_BOT_TOKEN),
                    chat_id: env.optional(ENV_TELEGRAM_CHAT_ID),
                    api_base: env
                        .optional(ENV_TELEGRAM_API_BASE)
                        .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
                },
            },
            export: ExportConfig {
                max_data_points: env.parse_or(ENV_EXPORT_MAX_POINTS, 100_000)?,
            },
            logging: LoggingConfig {
                format: match env.optional(ENV_LOG_FORMAT).as_deref() {
                    None | Some("pretty") | Some("console") => LogFormat::Pretty,
                    Some("json") => LogFormat::Json,
                    Some(other) => {
                        return Err(ConfigError::Invalid {
                            key: ENV_LOG_FORMAT,
                            value: other.to_string(),
                            reason: "expected 'pretty' or 'json'".to_string(),
                        });
                    }
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that cannot be expressed by parsing alone
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval.is_zero() {
            return Err(ConfigError::Constraint(
                "SCHEDULER_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.cow.notional_usde <= Decimal::ZERO {
            return Err(ConfigError::Constraint(
                "COW_NOTIONAL_USDE must be greater than zero".to_string(),
            ));
        }
        if self.alerting.threshold_pct < Decimal::ZERO {
            return Err(ConfigError::Constraint(
                "ALERT_THRESHOLD_PCT cannot be negative".to_string(),
            ));
        }
        if self.export.max_data_points == 0 {
            return Err(ConfigError::Constraint(
                "EXPORT_MAX_DATA_POINTS must be greater than zero".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Constraint(
                "DATABASE_MIN_CONNECTIONS cannot exceed DATABASE_MAX_CONNECTIONS".to_string(),
            ));
        }
        if self.alerting.telegram.enabled {
            if self.alerting.telegram.bot_token.is_none() {
                return Err(ConfigError::Missing(ENV_TELEGRAM_BOT_TOKEN));
            }
            if self.alerting.telegram.chat_id.is_none() {
                return Err(ConfigError::Missing(ENV_TELEGRAM_CHAT_ID));
            }
        }
        Ok(())
    }

    /// Export cap, preferring an explicit override
    pub fn resolve_max_points(&self, override_points: Option<usize>) -> usize {
        match override_points {
            Some(points) if points > 0 => points,
            _ => self.export.max_data_points,
        }
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    /// Empty strings count as unset
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn flag_or(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => match raw.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value: raw,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    /// Accepts decimal or 0x-prefixed hex
    fn lock_key_or(&self, key: &'static str, default: i64) -> Result<i64, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => {
                let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                    Some(hex) => i64::from_str_radix(hex, 16),
                    None => raw.parse::<i64>(),
                };
                parsed.map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_map(&values)
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.scheduler.interval, Duration::from_secs(300));
        assert!(config.scheduler.align_to_bucket);
        assert_eq!(config.scheduler.advisory_lock_key, 0x75734445);
        assert_eq!(config.cow.notional_usde, dec!(10000));
        assert_eq!(config.alerting.threshold_pct, dec!(0.4));
        assert_eq!(config.alerting.channels, vec!["telegram".to_string()]);
        assert!(!config.alerting.enabled);
        assert!(config.database.url.is_none());
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SCHEDULER_INTERVAL_SECS", "60"),
            ("SCHEDULER_ALIGN_TO_BUCKET", "false"),
            ("SCHEDULER_ADVISORY_LOCK_KEY", "0x10"),
            ("ALERT_THRESHOLD_PCT", "1.25"),
            ("ALERT_CHANNELS", "telegram, ops ,"),
            ("COW_NOTIONAL_USDE", "2500.5"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.scheduler.interval, Duration::from_secs(60));
        assert!(!config.scheduler.align_to_bucket);
        assert_eq!(config.scheduler.advisory_lock_key, 16);
        assert_eq!(config.alerting.threshold_pct, dec!(1.25));
        assert_eq!(config.alerting.channels, vec!["telegram", "ops"]);
        assert_eq!(config.cow.notional_usde, dec!(2500.5));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            load(&[("SCHEDULER_INTERVAL_SECS", "0")]),
            Err(ConfigError::Constraint(_))
        ));
    }

    #[test]
    fn test_negative_threshold_rejected() {
        assert!(load(&[("ALERT_THRESHOLD_PCT", "-0.1")]).is_err());
    }

    #[test]
    fn test_non_positive_notional_rejected() {
        assert!(load(&[("COW_NOTIONAL_USDE", "0")]).is_err());
    }

    #[test]
    fn test_unparseable_value_names_key() {
        let err = load(&[("SCHEDULER_INTERVAL_SECS", "five")]).unwrap_err();
        assert!(err.to_string().contains("SCHEDULER_INTERVAL_SECS"));
    }

    #[test]
    fn test_telegram_requires_credentials() {
        let err = load(&[("TELEGRAM_ENABLED", "true"), ("TELEGRAM_CHAT_ID", "42")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TELEGRAM_BOT_TOKEN")));

        let config = load(&[
            ("TELEGRAM_ENABLED", "true"),
            ("TELEGRAM_BOT_TOKEN", "token"),
            ("TELEGRAM_CHAT_ID", "42"),
        ])
        .unwrap();
        assert!(config.alerting.telegram.enabled);
    }

    #[test]
    fn test_resolve_max_points() {
        let config = load(&[("EXPORT_MAX_DATA_POINTS", "500")]).unwrap();
        assert_eq!(config.resolve_max_points(None), 500);
        assert_eq!(config.resolve_max_points(Some(0)), 500);
        assert_eq!(config.resolve_max_points(Some(20)), 20);
    }
}
