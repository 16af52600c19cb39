//! Beacon configuration module
//!
//! Layers built-in defaults, an optional `.env` file and `BEACON_*`
//! environment variables.

use crate::error::BeaconError;
use crate::rpc::routes::MAX_SHARD_COUNT;
use crate::shard::LeaseSettings;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Raw key/value view of the configuration sources
#[derive(Debug, Deserialize)]
struct RawConfig {
    host: String,
    port: u16,
    auth_token: Option<String>,
    secret_key_path: PathBuf,
    lease_lifetime_secs: u64,
    sweep_interval_ms: u64,
    notify_max_attempts: u32,
    notify_base_delay_ms: u64,
    request_timeout_ms: u64,
    max_shard_count: u32,
    log_level: String,
}

/// Beacon configuration
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Host to bind the WebSocket/HTTP listener on
    pub host: String,

    /// Port to bind
    pub port: u16,

    /// Shared bearer secret expected in the `Authorization` header
    pub auth_token: String,

    /// Lease lifetime and expiry sweep period
    pub lease: LeaseSettings,

    /// Delivery attempts per dead-lease notification
    pub notify_max_attempts: u32,

    /// First retry delay; doubles on every further attempt
    pub notify_base_delay: Duration,

    /// How long a server-to-client request waits for its reply
    pub request_timeout: Duration,

    /// Largest pool a client may set up or reset to
    pub max_shard_count: u32,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl BeaconConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, BeaconError> {
        dotenvy::dotenv().ok();
        Self::from_source(config::Environment::with_prefix("BEACON").try_parsing(true))
    }

    fn from_source<S>(source: S) -> Result<Self, BeaconError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let raw: RawConfig = config::Config::builder()
            .set_default("host", "127.0.0.1")
            .and_then(|b| b.set_default("port", 8765))
            .and_then(|b| b.set_default("secret_key_path", "secret.key"))
            .and_then(|b| b.set_default("lease_lifetime_secs", 30))
            .and_then(|b| b.set_default("sweep_interval_ms", 1000))
            .and_then(|b| b.set_default("notify_max_attempts", 3))
            .and_then(|b| b.set_default("notify_base_delay_ms", 500))
            .and_then(|b| b.set_default("request_timeout_ms", 10_000))
            .and_then(|b| b.set_default("max_shard_count", i64::from(MAX_SHARD_COUNT)))
            .and_then(|b| b.set_default("log_level", "info"))
            .map_err(|e| BeaconError::Config(e.to_string()))?
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BeaconError::Config(e.to_string()))?;

        let auth_token = match raw.auth_token {
            Some(token) => token,
            None => std::fs::read_to_string(&raw.secret_key_path).map_err(|e| {
                BeaconError::Config(format!(
                    "BEACON_AUTH_TOKEN is unset and {} is unreadable: {e}",
                    raw.secret_key_path.display()
                ))
            })?,
        };
        let auth_token = auth_token.trim().to_string();
        if auth_token.is_empty() {
            return Err(BeaconError::Config("bearer secret must not be empty".to_string()));
        }

        if raw.lease_lifetime_secs == 0 {
            return Err(BeaconError::Config(
                "BEACON_LEASE_LIFETIME_SECS must be positive".to_string(),
            ));
        }
        if raw.sweep_interval_ms == 0 {
            return Err(BeaconError::Config(
                "BEACON_SWEEP_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if raw.max_shard_count == 0 {
            return Err(BeaconError::Config(
                "BEACON_MAX_SHARD_COUNT must be positive".to_string(),
            ));
        }
        if raw.notify_max_attempts == 0 {
            return Err(BeaconError::Config(
                "BEACON_NOTIFY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            host: raw.host,
            port: raw.port,
            auth_token,
            lease: LeaseSettings {
                lifetime: Duration::from_secs(raw.lease_lifetime_secs),
                sweep_interval: Duration::from_millis(raw.sweep_interval_ms),
            },
            notify_max_attempts: raw.notify_max_attempts,
            notify_base_delay: Duration::from_millis(raw.notify_base_delay_ms),
            request_timeout: Duration::from_millis(raw.request_timeout_ms),
            max_shard_count: raw.max_shard_count,
            log_level: raw.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> config::Environment {
        let source: config::Map<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("BEACON")
            .try_parsing(true)
            .source(Some(source))
    }

    #[test]
    fn test_default_values() {
        let cfg = BeaconConfig::from_source(env(&[("BEACON_AUTH_TOKEN", "hunter2")])).unwrap();

        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.auth_token, "hunter2");
        assert_eq!(cfg.lease.lifetime, Duration::from_secs(30));
        assert_eq!(cfg.lease.sweep_interval, Duration::from_secs(1));
        assert_eq!(cfg.notify_max_attempts, 3);
        assert_eq!(cfg.max_shard_count, 65_536);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_overrides_are_parsed() {
        let cfg = BeaconConfig::from_source(env(&[
            ("BEACON_AUTH_TOKEN", "  padded  "),
            ("BEACON_PORT", "9000"),
            ("BEACON_LEASE_LIFETIME_SECS", "5"),
            ("BEACON_NOTIFY_BASE_DELAY_MS", "20"),
            ("BEACON_MAX_SHARD_COUNT", "128"),
        ]))
        .unwrap();

        assert_eq!(cfg.max_shard_count, 128);

        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.auth_token, "padded");
        assert_eq!(cfg.lease.lifetime, Duration::from_secs(5));
        assert_eq!(cfg.notify_base_delay, Duration::from_millis(20));
    }

    #[test]
    fn test_missing_secret_file_is_config_error() {
        let err = BeaconConfig::from_source(env(&[(
            "BEACON_SECRET_KEY_PATH",
            "/nonexistent/beacon/secret.key",
        )]))
        .unwrap_err();

        assert!(matches!(err, BeaconError::Config(_)));
    }

    #[test]
    fn test_zero_lifetime_rejected() {
        let err = BeaconConfig::from_source(env(&[
            ("BEACON_AUTH_TOKEN", "x"),
            ("BEACON_LEASE_LIFETIME_SECS", "0"),
        ]))
        .unwrap_err();

        assert!(err.to_string().contains("LIFETIME"));
    }
}
