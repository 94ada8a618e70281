//! # Service Configuration
//!
//! Defaults with environment overrides. Every knob that used to be a
//! process-wide constant in earlier iterations of this service (sweep
//! interval, bearer token) is an explicit field here so tests can inject
//! fast intervals and rotated tokens.

use std::time::Duration;

use crate::keys::DEFAULT_KEY_TTL;
use crate::storage::DEFAULT_SWEEP_INTERVAL;

/// Development fallback token; replace through `ENCLAVE_BEARER_TOKEN` in any
/// real deployment.
pub const DEFAULT_BEARER_TOKEN: &str =
    "VCJ9LmV5SnpkV0lpT2lJeE1qTTBOVFkzT0Rrd0lpd2libUZ0WlNJNklrcHZhRzRnUkc5bCI";

const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PEER_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address of the transit API server
    pub api_addr: String,

    /// Bind address of the peer-cache server
    pub peer_addr: String,

    /// Shared secret for bearer authentication
    pub bearer_token: String,

    /// TTL for keys created without an override
    pub default_key_ttl: Duration,

    /// Interval of the expired-key sweeper
    pub sweep_interval: Duration,

    /// Budget for graceful shutdown of both servers
    pub shutdown_grace: Duration,

    /// Log the bearer token at startup (debug aid)
    pub announce_token: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: DEFAULT_API_ADDR.to_string(),
            peer_addr: DEFAULT_PEER_ADDR.to_string(),
            bearer_token: DEFAULT_BEARER_TOKEN.to_string(),
            default_key_ttl: DEFAULT_KEY_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            announce_token: true,
        }
    }
}

impl Config {
    /// Defaults overridden by `ENCLAVE_*` environment variables.
    ///
    /// Durations are literals like `25m` or `90s`; unparseable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("ENCLAVE_API_ADDR") {
            config.api_addr = addr;
        }
        if let Ok(addr) = std::env::var("ENCLAVE_PEER_ADDR") {
            config.peer_addr = addr;
        }
        if let Ok(token) = std::env::var("ENCLAVE_BEARER_TOKEN") {
            config.bearer_token = token;
        }
        if let Some(ttl) = duration_var("ENCLAVE_KEY_TTL") {
            config.default_key_ttl = ttl;
        }
        if let Some(interval) = duration_var("ENCLAVE_SWEEP_INTERVAL") {
            config.sweep_interval = interval;
        }
        if let Some(grace) = duration_var("ENCLAVE_SHUTDOWN_GRACE") {
            config.shutdown_grace = grace;
        }
        if let Ok(flag) = std::env::var("ENCLAVE_ANNOUNCE_TOKEN") {
            config.announce_token = !matches!(flag.as_str(), "0" | "false" | "no");
        }

        config
    }
}

fn duration_var(name: &str) -> Option<Duration> {
    let literal = std::env::var(name).ok()?;
    match humantime::parse_duration(literal.trim()) {
        Ok(duration) => Some(duration),
        Err(err) => {
            tracing::warn!(var = name, value = %literal, error = %err, "ignoring unparseable duration");
            None
        }
    }
}
