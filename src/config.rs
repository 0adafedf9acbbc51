use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_BOOKING_WINDOW_DAYS;
use crate::policy::BusinessHoursPolicy;

#[derive(Debug)]
pub enum ConfigError {
    InvalidRange(String),
    Invalid(String),
    Parse(String),
    Io(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidRange(e) => write!(f, "invalid time range: {e}"),
            ConfigError::Invalid(e) => write!(f, "invalid configuration: {e}"),
            ConfigError::Parse(e) => write!(f, "parse error: {e}"),
            ConfigError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Knobs the booking core needs, independent of how the process is hosted.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// Days ahead of today (reference zone) that are generated and bookable.
    pub window_days: u32,
    /// Prefix for virtual meeting join URLs.
    pub join_url_base: String,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            join_url_base: "https://meet.slotbook.local".into(),
        }
    }
}

/// Process settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub policy_path: Option<PathBuf>,
    pub booking: BookingConfig,
    pub reconcile_interval: Duration,
    /// Reservations younger than this are never reclaimed by reconciliation.
    pub hold_grace: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let window_days: u32 = env_or("SLOTBOOK_WINDOW_DAYS", 30);
        if window_days == 0 || window_days > MAX_BOOKING_WINDOW_DAYS {
            return Err(ConfigError::Invalid(format!(
                "SLOTBOOK_WINDOW_DAYS must be within 1..={MAX_BOOKING_WINDOW_DAYS}"
            )));
        }
        let reconcile_secs: u64 = env_or("SLOTBOOK_RECONCILE_SECS", 300);
        if reconcile_secs == 0 {
            return Err(ConfigError::Invalid("SLOTBOOK_RECONCILE_SECS must be positive".into()));
        }

        Ok(Self {
            bind: env_or("SLOTBOOK_BIND", "0.0.0.0".to_string()),
            port: env_or("SLOTBOOK_PORT", 7480),
            data_dir: PathBuf::from(env_or("SLOTBOOK_DATA_DIR", "./data".to_string())),
            max_connections: env_or("SLOTBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("SLOTBOOK_COMPACT_THRESHOLD", 1000),
            metrics_port: std::env::var("SLOTBOOK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            policy_path: std::env::var("SLOTBOOK_POLICY").ok().map(PathBuf::from),
            booking: BookingConfig {
                window_days,
                join_url_base: env_or(
                    "SLOTBOOK_JOIN_URL_BASE",
                    BookingConfig::default().join_url_base,
                ),
            },
            reconcile_interval: Duration::from_secs(reconcile_secs),
            hold_grace: Duration::from_secs(env_or("SLOTBOOK_HOLD_GRACE_SECS", 60)),
        })
    }

    /// The configured policy file, or the built-in default.
    pub fn load_policy(&self) -> Result<BusinessHoursPolicy, ConfigError> {
        match &self.policy_path {
            Some(path) => BusinessHoursPolicy::from_file(path),
            None => Ok(BusinessHoursPolicy::default()),
        }
    }
}
