#![forbid(unsafe_code)]

// Server configuration, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_ROOM_CAPACITY: usize = 10;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 10;
const DEFAULT_PERSIST_BACKOFF_MS: u64 = 100;

/// Retry policy for write-through persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistPolicy {
    /// Extra attempts after the first failed write (0 = log and give up).
    pub retries: u32,
    /// Linear backoff unit; attempt `n` waits `backoff * n`.
    pub backoff: Duration,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::from_millis(DEFAULT_PERSIST_BACKOFF_MS),
        }
    }
}

/// Liveness settings for the idle-peer reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Peers not seen for this long are removed. `None` disables the reaper.
    pub peer_timeout: Option<Duration>,
    pub reaper_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            peer_timeout: None,
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub room_capacity: usize,
    /// Deadline for a single delivery to one connection.
    pub write_timeout: Duration,
    /// Receive loop gives up on a connection silent for this long.
    pub idle_timeout: Duration,
    pub liveness: LivenessConfig,
    pub persist: PersistPolicy,
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            room_capacity: DEFAULT_ROOM_CAPACITY,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            liveness: LivenessConfig::default(),
            persist: PersistPolicy::default(),
            database_url: None,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables, falling back to defaults for
    /// anything missing, unparsable or zero.
    pub fn from_env() -> Self {
        let port = positive_env("PORT", DEFAULT_PORT);
        let max_connections = positive_env("MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS);
        let room_capacity = positive_env("ROOM_CAPACITY", DEFAULT_ROOM_CAPACITY);
        let write_timeout =
            Duration::from_millis(positive_env("WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS));
        let idle_timeout =
            Duration::from_secs(positive_env("IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS));

        let peer_timeout = std::env::var("PEER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let reaper_interval = Duration::from_secs(positive_env(
            "REAPER_INTERVAL_SECS",
            DEFAULT_REAPER_INTERVAL_SECS,
        ));

        // Zero retries is a valid choice, so this one is not run through positive_env.
        let retries = std::env::var("PERSIST_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let backoff =
            Duration::from_millis(positive_env("PERSIST_BACKOFF_MS", DEFAULT_PERSIST_BACKOFF_MS));

        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());

        let config = Self {
            port,
            max_connections,
            room_capacity,
            write_timeout,
            idle_timeout,
            liveness: LivenessConfig {
                peer_timeout,
                reaper_interval,
            },
            persist: PersistPolicy { retries, backoff },
            database_url,
        };
        config.log();
        config
    }

    fn log(&self) {
        info!("Port: {}", self.port);
        info!("Max connections: {}", self.max_connections);
        info!("Room capacity: {}", self.room_capacity);
        info!("Write timeout: {:?}, idle timeout: {:?}", self.write_timeout, self.idle_timeout);
        match self.liveness.peer_timeout {
            Some(t) => info!(
                "Peer liveness timeout {:?} (checked every {:?})",
                t, self.liveness.reaper_interval
            ),
            None => info!("PEER_TIMEOUT_SECS not set, idle peers are never reaped"),
        }
        info!(
            "Persistence retries: {} (backoff {:?})",
            self.persist.retries, self.persist.backoff
        );
    }
}

/// Reads a numeric env var, rejecting zero and garbage with a warning.
fn positive_env<T>(name: &str, default: T) -> T
where
    T: FromStr + PartialEq + Default + Copy + std::fmt::Display,
{
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(v) if v != T::default() => v,
        Ok(_) => {
            warn!("{name}=0 is not allowed, using default {default}");
            default
        }
        Err(_) => {
            warn!("Invalid {name}={raw:?}, using default {default}");
            default
        }
    }
}
