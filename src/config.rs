//! Runtime configuration loaded from the environment.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub bind_addr: SocketAddr,
    /// How long a typing signal lives without a refreshing `typing:start`.
    pub typing_timeout: Duration,
    /// Frames buffered per connection before new frames are dropped.
    pub outbound_buffer: usize,
    pub jwt_secret: Option<String>,
    /// When set, presence is shared through Redis instead of kept in memory.
    pub redis_url: Option<String>,
    pub node_id: String,
}

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_TYPING_TIMEOUT_MS: u64 = 3000;
const DEFAULT_OUTBOUND_BUFFER: usize = 64;

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            jwt_secret: None,
            redis_url: None,
            node_id: Uuid::new_v4().to_string(),
        }
    }
}

impl SyncConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or(read("SYNC_BIND_ADDR"), "SYNC_BIND_ADDR", DEFAULT_BIND_ADDR)?;
        let typing_ms: u64 = parse_or(
            read("SYNC_TYPING_TIMEOUT_MS"),
            "SYNC_TYPING_TIMEOUT_MS",
            DEFAULT_TYPING_TIMEOUT_MS,
        )?;
        let outbound_buffer: usize = parse_or(
            read("SYNC_OUTBOUND_BUFFER"),
            "SYNC_OUTBOUND_BUFFER",
            DEFAULT_OUTBOUND_BUFFER,
        )?;
        if typing_ms == 0 {
            return Err(ConfigError::Invalid {
                var: "SYNC_TYPING_TIMEOUT_MS",
                value: "0".into(),
            });
        }
        if outbound_buffer == 0 {
            return Err(ConfigError::Invalid {
                var: "SYNC_OUTBOUND_BUFFER",
                value: "0".into(),
            });
        }

        Ok(Self {
            bind_addr,
            typing_timeout: Duration::from_millis(typing_ms),
            outbound_buffer,
            jwt_secret: read("JWT_SECRET"),
            redis_url: read("REDIS_URL"),
            node_id: read("SYNC_NODE_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
        })
    }

    pub fn require_jwt_secret(&self) -> Result<&str, ConfigError> {
        self.jwt_secret
            .as_deref()
            .ok_or(ConfigError::MissingVar("JWT_SECRET"))
    }
}

fn parse_or<T, D>(raw: Option<String>, var: &'static str, default: D) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    D: ToString,
{
    let value = raw.unwrap_or_else(|| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| vars.get(k).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
        assert_eq!(config.outbound_buffer, 64);
        assert!(config.redis_url.is_none());
        assert!(!config.node_id.is_empty());
        assert_eq!(
            config.require_jwt_secret(),
            Err(ConfigError::MissingVar("JWT_SECRET"))
        );
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SYNC_BIND_ADDR", "0.0.0.0:8080"),
            ("SYNC_TYPING_TIMEOUT_MS", "1500"),
            ("REDIS_URL", "redis://127.0.0.1/"),
            ("SYNC_NODE_ID", "node-a"),
            ("JWT_SECRET", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.typing_timeout, Duration::from_millis(1500));
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.require_jwt_secret(), Ok("s3cret"));
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = SyncConfig::from_lookup(lookup(&[("SYNC_TYPING_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "SYNC_TYPING_TIMEOUT_MS",
                value: "soon".into()
            }
        );
        assert!(SyncConfig::from_lookup(lookup(&[("SYNC_OUTBOUND_BUFFER", "0")])).is_err());
    }
}
