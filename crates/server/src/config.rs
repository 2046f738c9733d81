//! Server configuration, read from `BENCH_*` environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Timing of the runner protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long a runner may take to answer a command
    pub reply_timeout: Duration,
    /// How long a single archive frame may take to go out
    pub chunk_timeout: Duration,
    pub ping_interval: Duration,
    /// How long a runner may stay silent before it counts as gone
    pub pong_timeout: Duration,
    pub status_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(20),
            status_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub runner_token: String,
    pub chunk_size: usize,
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = SessionConfig::default();

        let bind_addr = match var("BENCH_BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "BENCH_BIND_ADDR",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8090)),
        };

        let data_dir = var("BENCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".bench-data"));
        let archive_dir = var("BENCH_ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("archives"));

        let runner_token = var("BENCH_RUNNER_TOKEN").ok_or(ConfigError::Missing {
            name: "BENCH_RUNNER_TOKEN",
        })?;

        let chunk_size = parse_number(&var, "BENCH_CHUNK_SIZE", 65536)?;
        if chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BENCH_CHUNK_SIZE",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let session = SessionConfig {
            reply_timeout: parse_secs(&var, "BENCH_REPLY_TIMEOUT_SECS", defaults.reply_timeout)?,
            chunk_timeout: parse_secs(&var, "BENCH_CHUNK_TIMEOUT_SECS", defaults.chunk_timeout)?,
            ping_interval: parse_secs(&var, "BENCH_PING_INTERVAL_SECS", defaults.ping_interval)?,
            pong_timeout: parse_secs(&var, "BENCH_PONG_TIMEOUT_SECS", defaults.pong_timeout)?,
            status_interval: parse_secs(&var, "BENCH_STATUS_INTERVAL_SECS", defaults.status_interval)?,
        };

        Ok(Self {
            bind_addr,
            data_dir,
            archive_dir,
            runner_token,
            chunk_size,
            session,
        })
    }
}

fn parse_number(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    match var(name) {
        Some(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let secs = parse_number(var, name, default.as_secs() as usize)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("BENCH_RUNNER_TOKEN", "secret")]).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 8090)));
        assert_eq!(config.data_dir, PathBuf::from(".bench-data"));
        assert_eq!(config.archive_dir, PathBuf::from(".bench-data/archives"));
        assert_eq!(config.runner_token, "secret");
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BENCH_RUNNER_TOKEN", "secret"),
            ("BENCH_BIND_ADDR", "127.0.0.1:9000"),
            ("BENCH_DATA_DIR", "/var/lib/bench"),
            ("BENCH_REPLY_TIMEOUT_SECS", "3"),
            ("BENCH_STATUS_INTERVAL_SECS", " 7 "),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.archive_dir, PathBuf::from("/var/lib/bench/archives"));
        assert_eq!(config.session.reply_timeout, Duration::from_secs(3));
        assert_eq!(config.session.status_interval, Duration::from_secs(7));
        assert_eq!(config.session.chunk_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_missing_token() {
        assert!(matches!(
            load(&[]),
            Err(ConfigError::Missing {
                name: "BENCH_RUNNER_TOKEN"
            })
        ));
        assert!(load(&[("BENCH_RUNNER_TOKEN", "  ")]).is_err());
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("BENCH_RUNNER_TOKEN", "x"), ("BENCH_PING_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("BENCH_PING_INTERVAL_SECS"));

        assert!(load(&[("BENCH_RUNNER_TOKEN", "x"), ("BENCH_CHUNK_SIZE", "0")]).is_err());
        assert!(load(&[("BENCH_RUNNER_TOKEN", "x"), ("BENCH_PONG_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("BENCH_RUNNER_TOKEN", "x"), ("BENCH_BIND_ADDR", "nowhere")]).is_err());
    }
}
