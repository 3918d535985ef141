//! Configuration module for pingfleet.
//!
//! Server configuration comes from environment variables with sensible
//! defaults. Probe settings are tunable at runtime and validated on every
//! update.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    Invalid {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the control plane (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingfleet.db")
    pub db_path: String,
    /// Upper bound on concurrent probes within a round (default: 64)
    pub probe_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pingfleet.db".to_string(),
            probe_workers: 64,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGFLEET_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PINGFLEET_DB_PATH`: Database file path (default: "pingfleet.db")
    /// - `PINGFLEET_PROBE_WORKERS`: Worker pool size per round (default: 64)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PINGFLEET_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("PINGFLEET_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(workers) = env::var("PINGFLEET_PROBE_WORKERS") {
            if let Ok(n) = workers.parse::<usize>() {
                cfg.probe_workers = n.max(1);
            }
        }

        cfg
    }
}

pub const PING_INTERVAL_RANGE: (u64, u64) = (1, 30);
pub const PAYLOAD_BYTES_RANGE: (u64, u64) = (8, 1400);
pub const TIMEOUT_MS_RANGE: (u64, u64) = (20, 1000);
pub const AUTO_REFRESH_RANGE: (u64, u64) = (1, 60);

/// Runtime probe settings. A round reads one snapshot at launch and keeps it
/// for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub ping_interval_sec: u64,
    pub icmp_payload_bytes: u64,
    pub icmp_timeout_ms: u64,
    /// Only consumed by the dashboard; stored and validated here.
    pub auto_refresh_sec: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ping_interval_sec: 2,
            icmp_payload_bytes: 56,
            icmp_timeout_ms: 800,
            auto_refresh_sec: 5,
        }
    }
}

impl ProbeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("ping_interval_sec", self.ping_interval_sec, PING_INTERVAL_RANGE)?;
        check_range("icmp_payload_bytes", self.icmp_payload_bytes, PAYLOAD_BYTES_RANGE)?;
        check_range("icmp_timeout_ms", self.icmp_timeout_ms, TIMEOUT_MS_RANGE)?;
        check_range("auto_refresh_sec", self.auto_refresh_sec, AUTO_REFRESH_RANGE)?;
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_sec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.icmp_timeout_ms)
    }

    pub fn payload_bytes(&self) -> usize {
        self.icmp_payload_bytes as usize
    }

    /// Upper bound for the per-worker start jitter: 30% of one interval,
    /// capped at 1.5 seconds.
    pub fn max_jitter(&self) -> Duration {
        let scaled = Duration::from_millis(self.ping_interval_sec * 300);
        scaled.min(Duration::from_millis(1500))
    }
}

fn check_range(field: &'static str, value: u64, (min, max): (u64, u64)) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "pingfleet.db");
        assert_eq!(cfg.probe_workers, 64);
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(ProbeSettings::default().validate().is_ok());
    }

    #[test]
    fn test_settings_bounds() {
        let mut s = ProbeSettings::default();
        s.ping_interval_sec = 30;
        s.icmp_payload_bytes = 8;
        s.icmp_timeout_ms = 1000;
        s.auto_refresh_sec = 60;
        assert!(s.validate().is_ok());

        s.ping_interval_sec = 0;
        assert_eq!(
            s.validate(),
            Err(ConfigError::Invalid {
                field: "ping_interval_sec",
                value: 0,
                min: 1,
                max: 30
            })
        );

        let mut s = ProbeSettings::default();
        s.icmp_payload_bytes = 1401;
        assert!(s.validate().is_err());

        let mut s = ProbeSettings::default();
        s.icmp_timeout_ms = 19;
        assert!(s.validate().is_err());

        let mut s = ProbeSettings::default();
        s.auto_refresh_sec = 61;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_max_jitter() {
        let mut s = ProbeSettings::default();
        s.ping_interval_sec = 1;
        assert_eq!(s.max_jitter(), Duration::from_millis(300));

        s.ping_interval_sec = 30;
        assert_eq!(s.max_jitter(), Duration::from_millis(1500));
    }
}
