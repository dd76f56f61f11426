//! Configuration types.
//!
//! Everything is read from the environment. Invalid values are reported as
//! [`ConfigError`] and are fatal at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default prefix stamped on every outbound message.
pub const DEFAULT_BOT_PREFIX: &str = "[BOT_RESPONSE]";

/// Longest retention window accepted, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Longest stale-claim threshold accepted (ten years). Cutoffs are computed
/// from the wall clock, so larger values would overflow the timestamp math.
pub const MAX_STALE_CLAIM_SECS: u64 = 10 * 365 * 24 * 60 * 60;

// ── Env helpers ─────────────────────────────────────────────────────

/// Read an optional variable. Empty values count as unset.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read a variable that must be present.
pub(crate) fn required_env(key: &str) -> Result<String, ConfigError> {
    optional_env(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an optional variable, falling back to `default` when unset.
pub(crate) fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn positive(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn at_most<T>(key: &str, value: T, max: T) -> Result<T, ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} exceeds the maximum of {max}"),
        });
    }
    Ok(value)
}

// ── Driver ──────────────────────────────────────────────────────────

/// Polling driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Time between scan cycles.
    pub poll_interval: Duration,
    /// Maximum eligible rows fetched per cycle.
    pub batch_size: usize,
    /// Size of the bounded worker pool.
    pub max_workers: usize,
    /// Claims older than this are reset by the sweep.
    pub stale_claim_after: Duration,
    /// Upper bound on a single scan/claim/dispatch cycle.
    pub cycle_timeout: Duration,
    /// Prune terminal messages older than this many days. Disabled when `None`.
    pub retention_days: Option<u32>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            max_workers: 4,
            stale_claim_after: Duration::from_secs(300), // 5 minutes
            cycle_timeout: Duration::from_secs(120),
            retention_days: None,
        }
    }
}

impl DriverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let poll = positive(
            "TRIAGE_POLL_INTERVAL_SECS",
            parse_env("TRIAGE_POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?,
        )?;
        let batch = positive(
            "TRIAGE_BATCH_SIZE",
            parse_env("TRIAGE_BATCH_SIZE", defaults.batch_size as u64)?,
        )?;
        let workers = positive(
            "TRIAGE_MAX_WORKERS",
            parse_env("TRIAGE_MAX_WORKERS", defaults.max_workers as u64)?,
        )?;
        let stale = positive(
            "TRIAGE_STALE_CLAIM_SECS",
            parse_env("TRIAGE_STALE_CLAIM_SECS", defaults.stale_claim_after.as_secs())?,
        )?;
        let stale = at_most("TRIAGE_STALE_CLAIM_SECS", stale, MAX_STALE_CLAIM_SECS)?;
        let cycle = positive(
            "TRIAGE_CYCLE_TIMEOUT_SECS",
            parse_env("TRIAGE_CYCLE_TIMEOUT_SECS", defaults.cycle_timeout.as_secs())?,
        )?;
        if stale <= cycle {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_STALE_CLAIM_SECS".to_string(),
                message: format!(
                    "must exceed TRIAGE_CYCLE_TIMEOUT_SECS ({cycle}s) or live claims get swept"
                ),
            });
        }
        let retention_days = match optional_env("TRIAGE_RETENTION_DAYS") {
            Some(_) => Some(at_most(
                "TRIAGE_RETENTION_DAYS",
                parse_env::<u32>("TRIAGE_RETENTION_DAYS", 0)?,
                MAX_RETENTION_DAYS,
            )?),
            None => None,
        };

        Ok(Self {
            poll_interval: Duration::from_secs(poll),
            batch_size: batch as usize,
            max_workers: workers as usize,
            stale_claim_after: Duration::from_secs(stale),
            cycle_timeout: Duration::from_secs(cycle),
            retention_days,
        })
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Per-run knobs for the workflow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on each generation or send call.
    pub call_timeout: Duration,
    /// How many prior channel messages the classifier and generator see.
    pub history_window: usize,
    /// Marker on outbound text. Inbound text carrying it is ignored.
    pub bot_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            history_window: 10,
            bot_prefix: DEFAULT_BOT_PREFIX.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let timeout = positive(
            "TRIAGE_CALL_TIMEOUT_SECS",
            parse_env("TRIAGE_CALL_TIMEOUT_SECS", defaults.call_timeout.as_secs())?,
        )?;
        Ok(Self {
            call_timeout: Duration::from_secs(timeout),
            history_window: parse_env("TRIAGE_HISTORY_WINDOW", defaults.history_window)?,
            bot_prefix: optional_env("TRIAGE_BOT_PREFIX").unwrap_or(defaults.bot_prefix),
        })
    }
}

// ── Slack ───────────────────────────────────────────────────────────

/// Credentials for the Slack Web API reply channel.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    pub api_base: String,
    pub bot_prefix: String,
}

impl SlackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: SecretString::from(required_env("SLACK_BOT_TOKEN")?),
            api_base: optional_env("SLACK_API_BASE")
                .unwrap_or_else(|| "https://slack.com/api".to_string()),
            bot_prefix: optional_env("TRIAGE_BOT_PREFIX")
                .unwrap_or_else(|| DEFAULT_BOT_PREFIX.to_string()),
        })
    }
}

// ── HTTP surface, storage, logs ─────────────────────────────────────

/// Process-level settings shared by the CLI commands.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8002)),
            db_path: PathBuf::from("./data/triage.db"),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parse_env("TRIAGE_API_ADDR", defaults.bind_addr)?,
            db_path: optional_env("TRIAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: optional_env("TRIAGE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
        })
    }

    /// Base URL the CLI uses to reach a running driver.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.bind_addr)
    }
}
