use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite URL of the on-device database (messages + audit ledger).
    pub device_db_url: String,
    /// Stable identifier of this device, recorded on every audit entry.
    pub device_fingerprint: String,
    /// Typing indicators older than this are expired for every reader.
    pub typing_ttl: Duration,
    /// Writer-side auto-clear timer. Purely an optimization; the reader-side
    /// freshness check stays on either way.
    pub typing_writer_timer: bool,
    /// Cadence of the background backup scan.
    pub sync_interval: Duration,
    /// Pending messages move to `failed` after this many push attempts.
    pub sync_max_attempts: u32,
    /// Retry policy for the send path (transient errors only).
    pub send_retry: RetryConfig,
    /// Hard cap applied to read page sizes.
    pub read_page_cap: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_db_url: "sqlite::memory:".into(),
            device_fingerprint: "unknown-device".into(),
            typing_ttl: Duration::from_secs(3),
            typing_writer_timer: true,
            sync_interval: Duration::from_secs(300),
            sync_max_attempts: 5,
            send_retry: RetryConfig::default(),
            read_page_cap: 200,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let mut config = Config::default();

        if let Ok(url) = env::var("GUILD_DEVICE_DB") {
            config.device_db_url = url;
        }
        if let Ok(fp) = env::var("GUILD_DEVICE_FINGERPRINT") {
            config.device_fingerprint = fp;
        }
        if let Some(ms) = parse_env::<u64>("GUILD_TYPING_TTL_MS")? {
            config.typing_ttl = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse_env::<bool>("GUILD_TYPING_WRITER_TIMER")? {
            config.typing_writer_timer = enabled;
        }
        if let Some(secs) = parse_env::<u64>("GUILD_SYNC_INTERVAL_SECS")? {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_env::<u32>("GUILD_SYNC_MAX_ATTEMPTS")? {
            config.sync_max_attempts = attempts.max(1);
        }
        if let Some(retries) = parse_env::<u32>("GUILD_SEND_MAX_RETRIES")? {
            config.send_retry.max_retries = retries;
        }
        if let Some(cap) = parse_env::<i64>("GUILD_READ_PAGE_CAP")? {
            config.read_page_cap = cap.max(1);
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{key} has unparseable value {raw:?}"))),
        Err(_) => Ok(None),
    }
}
