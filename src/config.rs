//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable holding a slave list, same grammar as `--distributed=`.
pub const SLAVES_ENV: &str = "DISTBUILD_SLAVES";

/// Build session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of compilation jobs the local host runs concurrently.
    pub local_parallelism: usize,
    /// Slot count for slave entries that do not declare one.
    pub default_slots: usize,
    /// Port for slave entries that do not declare one.
    pub default_port: u16,
    /// Upper bound on connect + handshake + source sync for one slave.
    pub connect_timeout: Duration,
    /// Upper bound on handing one compile request to a slave channel.
    pub send_timeout: Duration,
    /// Upper bound on a graceful disconnect of one slave.
    pub disconnect_timeout: Duration,
    /// Upper bound on a disconnect of one slave when tearing down after an interrupt.
    pub signal_disconnect_timeout: Duration,
    /// Upper bound on delivering a cleanup request to one slave.
    pub cleanup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            default_slots: 2,
            default_port: 8484,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            signal_disconnect_timeout: Duration::from_millis(500),
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Build a configuration from defaults overridden by `DISTBUILD_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SessionConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(jobs) = parse_var::<usize, _>(&lookup, "DISTBUILD_JOBS")? {
            config.local_parallelism = jobs;
        }
        if let Some(slots) = parse_var::<usize, _>(&lookup, "DISTBUILD_DEFAULT_SLOTS")? {
            if slots == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "DISTBUILD_DEFAULT_SLOTS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.default_slots = slots;
        }
        if let Some(port) = parse_var::<u16, _>(&lookup, "DISTBUILD_PORT")? {
            config.default_port = port;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "DISTBUILD_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "DISTBUILD_SEND_TIMEOUT_MS")? {
            config.send_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "DISTBUILD_DISCONNECT_TIMEOUT_MS")? {
            config.disconnect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "DISTBUILD_SIGNAL_TIMEOUT_MS")? {
            config.signal_disconnect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "DISTBUILD_CLEANUP_TIMEOUT_MS")? {
            config.cleanup_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Timeout applied to each slave disconnect, depending on how teardown was triggered.
    pub fn teardown_timeout(&self, from_signal: bool) -> Duration {
        if from_signal {
            self.signal_disconnect_timeout
        } else {
            self.disconnect_timeout
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
