//! Link engine configuration parameters
//!
//! All tunable timing, retry and probe-limit parameters.
//! The host application may load them from JSON or keep them in its own
//! preference store as compact postcard bytes.

use core::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Longest accepted pre-shared session key, bytes.
pub const MAX_SESSION_KEY_LEN: usize = 32;

pub type SessionKey = heapless::Vec<u8, MAX_SESSION_KEY_LEN>;

/// Core link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    // --- Commands ---
    /// Default per-command acknowledgement timeout (milliseconds)
    pub command_timeout_ms: u32,
    /// OPEN_SESSION acknowledgement timeout (milliseconds)
    pub session_open_timeout_ms: u32,
    /// Commands allowed to await acknowledgement at once
    pub max_in_flight: u8,

    // --- Session ---
    /// Keepalive period, independent of the granted lease (milliseconds)
    pub keepalive_interval_ms: u32,
    /// Lease assumed when the peer's grant omits one (milliseconds)
    pub default_lease_ms: u32,
    /// Telemetry older than this degrades the link (milliseconds)
    pub telemetry_stale_ms: u32,
    /// Optional pre-shared key, hex encoded
    pub session_key: Option<String>,

    // --- Periodic work ---
    /// Signal-quality poll interval (milliseconds)
    pub signal_poll_interval_ms: u32,
    /// Run-progress tick interval (milliseconds)
    pub run_tick_ms: u32,

    // --- Connection ---
    /// Budget for each of connect / discover / subscribe (milliseconds)
    pub step_timeout_ms: u32,
    /// Automatic reconnect attempts after an unexpected loss
    pub reconnect_max_attempts: u8,
    /// Fixed delay between reconnect attempts (milliseconds)
    pub reconnect_delay_ms: u32,

    // --- Probe limits ---
    /// Process values below this are a probe error (Celsius)
    pub probe_low_limit_c: f32,
    /// Process values above this are a probe error (Celsius)
    pub probe_high_limit_c: f32,
    /// Controller exempt from the low-limit check
    pub cryogenic_controller: Option<u8>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            // Commands
            command_timeout_ms: 2000,
            session_open_timeout_ms: 3000,
            max_in_flight: 16,

            // Session
            keepalive_interval_ms: 1000,
            default_lease_ms: 3000,
            telemetry_stale_ms: 3000,
            session_key: None,

            // Periodic work
            signal_poll_interval_ms: 2000,
            run_tick_ms: 1000, // 1 Hz

            // Connection
            step_timeout_ms: 10_000,
            reconnect_max_attempts: 3,
            reconnect_delay_ms: 2000,

            // Probe limits
            probe_low_limit_c: -40.0,
            probe_high_limit_c: 450.0,
            cryogenic_controller: Some(0),
        }
    }
}

impl LinkConfig {
    /// Range-check every field. Returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            (self.command_timeout_ms, "command_timeout_ms must be > 0"),
            (self.session_open_timeout_ms, "session_open_timeout_ms must be > 0"),
            (self.keepalive_interval_ms, "keepalive_interval_ms must be > 0"),
            (self.default_lease_ms, "default_lease_ms must be > 0"),
            (self.telemetry_stale_ms, "telemetry_stale_ms must be > 0"),
            (self.signal_poll_interval_ms, "signal_poll_interval_ms must be > 0"),
            (self.run_tick_ms, "run_tick_ms must be > 0"),
            (self.step_timeout_ms, "step_timeout_ms must be > 0"),
        ];
        for (value, rule) in nonzero {
            if value == 0 {
                return Err(ConfigError::ValidationFailed(rule));
            }
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ValidationFailed("max_in_flight must be > 0"));
        }
        if self.keepalive_interval_ms >= self.default_lease_ms {
            return Err(ConfigError::ValidationFailed(
                "keepalive_interval_ms must be shorter than default_lease_ms",
            ));
        }
        if self.probe_low_limit_c.partial_cmp(&self.probe_high_limit_c) != Some(Ordering::Less) {
            return Err(ConfigError::ValidationFailed(
                "probe_low_limit_c must be below probe_high_limit_c",
            ));
        }
        self.session_key_bytes()?;
        Ok(())
    }

    /// Decode the hex session key, if any.
    pub fn session_key_bytes(&self) -> Result<Option<SessionKey>, ConfigError> {
        let Some(encoded) = self.session_key.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim())
            .map_err(|_| ConfigError::ValidationFailed("session_key must be hex encoded"))?;
        if bytes.is_empty() {
            return Err(ConfigError::ValidationFailed("session_key must not be empty"));
        }
        let key = SessionKey::from_slice(&bytes)
            .map_err(|()| ConfigError::ValidationFailed("session_key must be at most 32 bytes"))?;
        Ok(Some(key))
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string(self).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Compact binary form for the host's preference store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let cfg: Self =
            postcard::from_bytes(bytes).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
