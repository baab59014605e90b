use std::path::PathBuf;
use std::time::Duration;

use crate::mailer::{Backoff, DispatchPolicy};
use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String, reason: String },
    TlsPair,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "invalid {var}={value:?}: {reason}")
            }
            ConfigError::TlsPair => {
                write!(f, "both CONVOY_TLS_CERT and CONVOY_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub from_address: String,
    pub dispatch: DispatchPolicy,
    pub recipient_cache_ttl_ms: Ms,
    pub reminder_period: Duration,
    pub reminder_window_ms: Ms,
    pub completion_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "convoy".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            from_address: "noreply@example.com".into(),
            dispatch: DispatchPolicy::default(),
            recipient_cache_ttl_ms: 600_000,
            reminder_period: Duration::from_millis(1_800_000),
            reminder_window_ms: 86_400_000,
            completion_period: Duration::from_millis(60_000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        let get = |var: &'static str| lookup(var).map(|v| (var, v));

        if let Some((_, v)) = get("CONVOY_BIND") {
            cfg.bind = v;
        }
        if let Some((var, v)) = get("CONVOY_PORT") {
            cfg.port = parse(var, &v)?;
        }
        if let Some((_, v)) = get("CONVOY_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some((_, v)) = get("CONVOY_PASSWORD") {
            cfg.password = v;
        }
        if let Some((var, v)) = get("CONVOY_MAX_CONNECTIONS") {
            cfg.max_connections = at_least_one(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_COMPACT_THRESHOLD") {
            cfg.compact_threshold = parse(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_METRICS_PORT") {
            cfg.metrics_port = Some(parse(var, &v)?);
        }
        cfg.tls_cert = lookup("CONVOY_TLS_CERT");
        cfg.tls_key = lookup("CONVOY_TLS_KEY");
        if cfg.tls_cert.is_some() != cfg.tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }
        if let Some((_, v)) = get("CONVOY_FROM_ADDRESS") {
            cfg.from_address = v;
        }

        if let Some((var, v)) = get("CONVOY_BATCH_SIZE") {
            cfg.dispatch.batch_size = at_least_one(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_SEND_ATTEMPTS") {
            cfg.dispatch.max_attempts = at_least_one::<u32>(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_RETRY_BACKOFF_MS") {
            cfg.dispatch.backoff = Backoff::Fixed(Duration::from_millis(parse(var, &v)?));
        }
        if let Some((var, v)) = get("CONVOY_BATCH_CONCURRENCY") {
            cfg.dispatch.concurrency = at_least_one(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_RECIPIENT_CACHE_TTL_MS") {
            cfg.recipient_cache_ttl_ms = non_negative(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_REMINDER_PERIOD_MS") {
            cfg.reminder_period = Duration::from_millis(at_least_one(var, &v)?);
        }
        if let Some((var, v)) = get("CONVOY_REMINDER_WINDOW_MS") {
            cfg.reminder_window_ms = non_negative(var, &v)?;
        }
        if let Some((var, v)) = get("CONVOY_COMPLETION_PERIOD_MS") {
            cfg.completion_period = Duration::from_millis(at_least_one(var, &v)?);
        }
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("convoy.wal")
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn at_least_one<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + From<u8>,
    T::Err: std::fmt::Display,
{
    let n: T = parse(var, value)?;
    if n < T::from(1) {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(n)
}

fn non_negative(var: &'static str, value: &str) -> Result<Ms, ConfigError> {
    let n: Ms = parse(var, value)?;
    if n < 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must not be negative".into(),
        });
    }
    Ok(n)
}
