//! Configuration management
//!
//! All runtime configuration is built once at startup from environment
//! variables (a `.env` file is honored). Every knob has a documented default
//! so the engine runs with nothing but API credentials set.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::Money;

/// Per-urgency monitoring intervals, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorIntervals {
    pub critical: u64,
    pub urgent: u64,
    pub active: u64,
    pub building: u64,
    pub stable: u64,
    pub dormant: u64,
}

impl Default for MonitorIntervals {
    fn default() -> Self {
        MonitorIntervals {
            critical: 2,
            urgent: 5,
            active: 12,
            building: 20,
            stable: 60,
            dormant: 180,
        }
    }
}

/// API credentials for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// ENABLE_ENHANCED_TP_SL - the engine refuses to start without it
    pub enhanced_tp_sl_enabled: bool,
    /// ENABLE_MIRROR_TRADING
    pub mirror_enabled: bool,
    /// CANCEL_LIMITS_ON_TP1
    pub cancel_limits_on_tp1: bool,
    /// EXTERNAL_ORDER_PROTECTION - only touch orders with known link prefixes
    pub external_order_protection: bool,
    /// DEFAULT_ALERT_CHAT_ID - fallback recipient when a monitor has none
    pub default_alert_chat_id: Option<i64>,
    /// ADOPT_ORPHAN_POSITIONS - reconciler may synthesize monitors
    pub adopt_orphan_positions: bool,

    /// BREAKEVEN_FEE_RATE (taker fee, one side), default 0.06%
    pub breakeven_fee_rate: Money,
    /// BREAKEVEN_SAFETY_MARGIN, default 0.02%
    pub breakeven_safety_margin: Money,

    /// MONITOR_INTERVAL_* overrides
    pub intervals: MonitorIntervals,
    /// MAX_CONCURRENT_MONITORS - global pass semaphore size
    pub max_concurrent_monitors: usize,
    /// MAX_EXCHANGE_REQUESTS - per-account request permits per second
    pub max_exchange_requests: usize,
    /// Raised per-account request permits while execution mode is active
    pub execution_exchange_requests: usize,
    /// EXECUTION_MODE_TTL_SECS
    pub execution_mode_ttl: Duration,

    /// CACHE_DEFAULT_TTL
    pub cache_default_ttl: Duration,
    /// CACHE_EXECUTION_TTL
    pub cache_execution_ttl: Duration,

    /// PERSISTENCE_PATH - snapshot file location
    pub persistence_path: PathBuf,
    /// PERSISTENCE_BATCH_INTERVAL - non-critical flush cadence
    pub persistence_batch_interval: Duration,
    /// BACKUP_INTERVAL - minimum time between timestamped backups
    pub backup_interval: Duration,
    /// MAX_BACKUPS - rotation depth
    pub max_backups: usize,

    /// Hard per-request exchange timeout
    pub exchange_timeout: Duration,
    /// Wall-clock ceiling for one monitor pass
    pub pass_timeout: Duration,
    /// How long shutdown waits for in-flight passes
    pub shutdown_drain: Duration,

    /// BYBIT_API_BASE_URL
    pub api_base_url: String,
    pub main_credentials: Option<ApiCredentials>,
    pub mirror_credentials: Option<ApiCredentials>,

    /// LOG_DIR - when set, a daily-rolling file layer is added
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enhanced_tp_sl_enabled: false,
            mirror_enabled: false,
            cancel_limits_on_tp1: true,
            external_order_protection: true,
            default_alert_chat_id: None,
            adopt_orphan_positions: false,
            breakeven_fee_rate: Money::new(6, 4),       // 0.0006
            breakeven_safety_margin: Money::new(2, 4),  // 0.0002
            intervals: MonitorIntervals::default(),
            max_concurrent_monitors: 15,
            max_exchange_requests: 20,
            execution_exchange_requests: 50,
            execution_mode_ttl: Duration::from_secs(180),
            cache_default_ttl: Duration::from_secs(15),
            cache_execution_ttl: Duration::from_secs(5),
            persistence_path: PathBuf::from("data/monitors.json"),
            persistence_batch_interval: Duration::from_secs(30),
            backup_interval: Duration::from_secs(15 * 60),
            max_backups: 5,
            exchange_timeout: Duration::from_secs(60),
            pass_timeout: Duration::from_secs(90),
            shutdown_drain: Duration::from_secs(30),
            api_base_url: "https://api.bybit.com".to_string(),
            main_credentials: None,
            mirror_credentials: None,
            log_dir: None,
        }
    }
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        config.enhanced_tp_sl_enabled = env_bool("ENABLE_ENHANCED_TP_SL", false)?;
        config.mirror_enabled = env_bool("ENABLE_MIRROR_TRADING", false)?;
        config.cancel_limits_on_tp1 = env_bool("CANCEL_LIMITS_ON_TP1", true)?;
        config.external_order_protection = env_bool("EXTERNAL_ORDER_PROTECTION", true)?;
        config.adopt_orphan_positions = env_bool("ADOPT_ORPHAN_POSITIONS", false)?;
        config.default_alert_chat_id = env_opt("DEFAULT_ALERT_CHAT_ID")?;

        if let Some(rate) = env_opt::<Money>("BREAKEVEN_FEE_RATE")? {
            config.breakeven_fee_rate = rate;
        }
        if let Some(margin) = env_opt::<Money>("BREAKEVEN_SAFETY_MARGIN")? {
            config.breakeven_safety_margin = margin;
        }

        config.intervals = MonitorIntervals {
            critical: env_or("MONITOR_INTERVAL_CRITICAL", config.intervals.critical)?,
            urgent: env_or("MONITOR_INTERVAL_URGENT", config.intervals.urgent)?,
            active: env_or("MONITOR_INTERVAL_ACTIVE", config.intervals.active)?,
            building: env_or("MONITOR_INTERVAL_BUILDING", config.intervals.building)?,
            stable: env_or("MONITOR_INTERVAL_STABLE", config.intervals.stable)?,
            dormant: env_or("MONITOR_INTERVAL_DORMANT", config.intervals.dormant)?,
        };

        config.max_concurrent_monitors =
            env_or("MAX_CONCURRENT_MONITORS", config.max_concurrent_monitors)?;
        config.max_exchange_requests =
            env_or("MAX_EXCHANGE_REQUESTS", config.max_exchange_requests)?;
        config.execution_exchange_requests = env_or(
            "EXECUTION_EXCHANGE_REQUESTS",
            config.execution_exchange_requests,
        )?;
        config.execution_mode_ttl =
            Duration::from_secs(env_or("EXECUTION_MODE_TTL_SECS", 180u64)?);

        config.cache_default_ttl = Duration::from_secs(env_or("CACHE_DEFAULT_TTL", 15u64)?);
        config.cache_execution_ttl = Duration::from_secs(env_or("CACHE_EXECUTION_TTL", 5u64)?);

        if let Ok(path) = std::env::var("PERSISTENCE_PATH") {
            config.persistence_path = PathBuf::from(path);
        }
        config.persistence_batch_interval =
            Duration::from_secs(env_or("PERSISTENCE_BATCH_INTERVAL", 30u64)?);
        config.backup_interval = Duration::from_secs(env_or("BACKUP_INTERVAL", 15 * 60u64)?);
        config.max_backups = env_or("MAX_BACKUPS", config.max_backups)?;

        if let Ok(url) = std::env::var("BYBIT_API_BASE_URL") {
            config.api_base_url = url;
        }
        config.main_credentials = credentials_from_env("BYBIT_API_KEY", "BYBIT_API_SECRET");
        config.mirror_credentials =
            credentials_from_env("BYBIT_MIRROR_API_KEY", "BYBIT_MIRROR_API_SECRET");

        config.log_dir = std::env::var("LOG_DIR").ok().map(PathBuf::from);

        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.enhanced_tp_sl_enabled {
            bail!("ENABLE_ENHANCED_TP_SL is not set; refusing to start");
        }
        if self.main_credentials.is_none() {
            bail!("BYBIT_API_KEY / BYBIT_API_SECRET are required");
        }
        if self.mirror_enabled && self.mirror_credentials.is_none() {
            bail!("ENABLE_MIRROR_TRADING is set but mirror credentials are missing");
        }
        if self.max_concurrent_monitors == 0 {
            bail!("MAX_CONCURRENT_MONITORS must be at least 1");
        }
        Ok(())
    }

    /// Due interval for an urgency class.
    pub fn interval_for(&self, urgency: crate::types::Urgency) -> Duration {
        use crate::types::Urgency;
        let secs = match urgency {
            Urgency::Critical => self.intervals.critical,
            Urgency::Urgent => self.intervals.urgent,
            Urgency::Active => self.intervals.active,
            Urgency::Building => self.intervals.building,
            Urgency::Stable => self.intervals.stable,
            Urgency::Dormant => self.intervals.dormant,
        };
        Duration::from_secs(secs)
    }
}

fn credentials_from_env(key_var: &str, secret_var: &str) -> Option<ApiCredentials> {
    match (std::env::var(key_var), std::env::var(secret_var)) {
        (Ok(api_key), Ok(api_secret)) if !api_key.is_empty() && !api_secret.is_empty() => {
            Some(ApiCredentials {
                api_key,
                api_secret,
            })
        }
        _ => None,
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => bail!("{} has unrecognized boolean value: {}", key, other),
        },
        Err(_) => Ok(default),
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e)),
        _ => Ok(None),
    }
}

// Load a `.env` file once before reading configuration.
pub fn load_dotenv() {
    dotenv::dotenv().ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Urgency;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.intervals.critical, 2);
        assert_eq!(config.intervals.dormant, 180);
        assert_eq!(config.max_concurrent_monitors, 15);
        assert_eq!(config.cache_default_ttl, Duration::from_secs(15));
        assert_eq!(config.breakeven_fee_rate, Money::new(6, 4));
        assert_eq!(config.breakeven_safety_margin, Money::new(2, 4));
        assert!(config.cancel_limits_on_tp1);
        assert!(config.external_order_protection);
        assert!(!config.adopt_orphan_positions);
    }

    #[test]
    fn interval_lookup() {
        let config = Config::default();
        assert_eq!(config.interval_for(Urgency::Critical), Duration::from_secs(2));
        assert_eq!(config.interval_for(Urgency::Urgent), Duration::from_secs(5));
        assert_eq!(config.interval_for(Urgency::Active), Duration::from_secs(12));
        assert_eq!(
            config.interval_for(Urgency::Building),
            Duration::from_secs(20)
        );
        assert_eq!(config.interval_for(Urgency::Stable), Duration::from_secs(60));
        assert_eq!(
            config.interval_for(Urgency::Dormant),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn validate_requires_engine_flag() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_mirror_credentials_when_enabled() {
        let mut config = Config {
            enhanced_tp_sl_enabled: true,
            mirror_enabled: true,
            ..Config::default()
        };
        config.main_credentials = Some(ApiCredentials {
            api_key: "k".into(),
            api_secret: "s".into(),
        });
        assert!(config.validate().is_err());

        config.mirror_credentials = Some(ApiCredentials {
            api_key: "mk".into(),
            api_secret: "ms".into(),
        });
        assert!(config.validate().is_ok());
    }
}
