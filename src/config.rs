use std::{
    env,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

use crate::limits::RequestLimits;
use crate::store::{KeyScope, RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Service configuration, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub listen_addr: SocketAddr,
    pub key_scope: KeyScope,
    pub retry: RetryPolicy,
    pub limits: RequestLimits,
    /// How long in-flight requests may drain after a shutdown signal
    pub shutdown_grace: Duration,
    pub verbose: bool,
    pub log_format: LogFormat,
    pub version: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        // Default to 2x CPU cores, but not less than 5
        let default_max_connections = std::thread::available_parallelism()
            .map(|n| n.get() as u32 * 2)
            .unwrap_or(10)
            .max(5);

        let defaults = RetryPolicy::default();
        let limit_defaults = RequestLimits::default();
        let default_timeout = NonZeroU64::new(limit_defaults.timeout.as_secs()).unwrap_or(NonZeroU64::MIN);

        Ok(Self {
            database_url,
            max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", default_max_connections)?,
            min_connections: parse_or(&get, "DATABASE_MIN_CONNECTIONS", 1)?,
            acquire_timeout: Duration::from_secs(parse_or(&get, "DATABASE_ACQUIRE_TIMEOUT", 30)?),
            idle_timeout: Duration::from_secs(parse_or(&get, "DATABASE_IDLE_TIMEOUT", 600)?),
            listen_addr: parse_or(
                &get,
                "LISTEN_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 3000)),
            )?,
            key_scope: parse_or(&get, "LEDGER_KEY_SCOPE", KeyScope::Global)?,
            retry: RetryPolicy {
                max_attempts: parse_or(&get, "LEDGER_TX_ATTEMPTS", defaults.max_attempts)?,
                base_backoff: Duration::from_millis(parse_or(
                    &get,
                    "LEDGER_RETRY_BACKOFF_MS",
                    defaults.base_backoff.as_millis() as u64,
                )?),
            },
            limits: RequestLimits {
                timeout: Duration::from_secs(
                    parse_or::<NonZeroU64, _>(&get, "REQUEST_TIMEOUT", default_timeout)?.get(),
                ),
                concurrency: parse_or::<NonZeroUsize, _>(
                    &get,
                    "REQUEST_CONCURRENCY",
                    limit_defaults.concurrency,
                )?,
                per_ip_per_minute: parse_or::<NonZeroU32, _>(
                    &get,
                    "RATE_LIMIT_PER_MINUTE",
                    limit_defaults.per_ip_per_minute,
                )?,
            },
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE", 10)?),
            verbose: get("VERBOSE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_format: match get("LOG_FORMAT").map(|v| v.to_ascii_lowercase()).as_deref() {
                None | Some("text") => LogFormat::Text,
                Some("json") => LogFormat::Json,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "LOG_FORMAT",
                        value: other.to_string(),
                    })
                }
            },
            version: get("APP_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
