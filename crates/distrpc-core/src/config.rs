//! Plain, `serde`-derived configuration structs for the client, server
//! and cache, each with a sane `Default`. Grounded in the style of the
//! teacher's own config blocks (`retry::RetryConfig`, `health`'s
//! thresholds, `flowcontrol`/`circuitbreaker`'s tunables) — small
//! structs, no builder pattern, no external config-loading crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::BackoffSchedule;

/// One address a [`crate::server::Server`] should listen on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSpec {
    /// Transport protocol name, e.g. `"tcp"`.
    pub protocol: String,
    /// Bind address, e.g. `"0.0.0.0:0"`.
    pub address: String,
}

impl ListenSpec {
    /// A spec for the given protocol/address pair.
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        ListenSpec {
            protocol: protocol.into(),
            address: address.into(),
        }
    }
}

/// Tunables for the connection cache (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Soft cap on live connections; `0` means unbounded.
    pub max_connections: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { max_connections: 0 }
    }
}

/// Tunables for the client call state machine (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default call deadline when the caller supplies none.
    #[serde(with = "duration_millis")]
    pub default_deadline: Duration,
    /// Preferred transport protocols, in order; empty accepts any.
    pub preferred_protocols: Vec<String>,
    /// Starting backoff delay between retry attempts.
    #[serde(with = "duration_millis")]
    pub retry_initial_backoff: Duration,
    /// Ceiling on backoff delay between retry attempts.
    #[serde(with = "duration_millis")]
    pub retry_max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            default_deadline: Duration::from_secs(30),
            preferred_protocols: Vec::new(),
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Builds a fresh backoff schedule from this config's tunables.
    pub fn backoff_schedule(&self) -> BackoffSchedule {
        BackoffSchedule::new(self.retry_initial_backoff, self.retry_max_backoff, 2.0)
    }
}

/// Tunables for the server flow acceptor (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Addresses to listen on at startup.
    pub listen_specs: Vec<ListenSpec>,
    /// Grace period given to in-flight handlers during `Stop()` before
    /// the watchdog logs a stall and returns anyway.
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
    /// Whether this server is a leaf object (no suffix routing).
    pub leaf: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_specs: Vec::new(),
            drain_timeout: Duration::from_secs(5),
            leaf: false,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
