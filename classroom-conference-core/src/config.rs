//! Conference configuration
//!
//! Every field can be set through an environment variable prefixed with
//! `CLASSROOM_`. Defaults are suitable for local development against a relay
//! on the loopback interface.

use crate::quality::QualityThresholds;
use crate::types::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed
    #[error("Invalid value for {key}: {value:?}")]
    Invalid {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },

    /// Values parsed but are inconsistent
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// One STUN or TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Whether this is a relay (TURN) server
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed after the first failure
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Upper bound for any delay
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    ///
    /// `initial_backoff * multiplier^(attempt - 1)`, capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether retry number `attempt` (1-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Signaling relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay endpoint URL
    pub endpoint: String,
    /// Relay credential, sent when connecting
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Reconnect schedule after the relay drops
    pub reconnect: RetryPolicy,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/signal".to_string(),
            token: None,
            reconnect: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(250),
                max_backoff: Duration::from_secs(5),
                multiplier: 2.0,
            },
        }
    }
}

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Renegotiation schedule after a failed or lost connection
    pub retry: RetryPolicy,
    /// Deadline for one negotiation attempt to reach `connected`
    #[serde(with = "duration_ms")]
    pub negotiation_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            negotiation_timeout: Duration::from_secs(15),
        }
    }
}

/// Quality sampling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Sampling period per peer
    #[serde(with = "duration_ms")]
    pub sampling_interval: Duration,
    /// Classification thresholds
    pub thresholds: QualityThresholds,
    /// Consecutive better samples needed before the level rises
    pub upgrade_dwell: u32,
    /// Consecutive worse samples needed before the level drops
    pub downgrade_dwell: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(2),
            thresholds: QualityThresholds::default(),
            upgrade_dwell: 2,
            downgrade_dwell: 2,
        }
    }
}

/// Complete conference configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConferenceConfig {
    /// STUN/TURN servers handed to the peer transport
    pub ice_servers: Vec<IceServerConfig>,
    /// Signaling relay
    pub signaling: SignalingConfig,
    /// Local capture constraints
    pub media: MediaConstraints,
    /// Peer connection retry policy
    pub peer: PeerConfig,
    /// Quality monitoring
    pub quality: QualityConfig,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![DEFAULT_STUN.to_string()],
                username: None,
                credential: None,
            }],
            signaling: SignalingConfig::default(),
            media: MediaConstraints::default(),
            peer: PeerConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl ConferenceConfig {
    /// Load configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparseable value or the
    /// resulting configuration is inconsistent
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    ///
    /// # Errors
    ///
    /// Same as [`ConferenceConfig::from_env`]
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let turn_username = lookup("CLASSROOM_TURN_USERNAME").filter(|s| !s.is_empty());
        let turn_credential = lookup("CLASSROOM_TURN_CREDENTIAL").filter(|s| !s.is_empty());
        let ice_servers = env_csv(&lookup, "CLASSROOM_ICE_SERVERS", &[DEFAULT_STUN])
            .into_iter()
            .map(|url| {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                IceServerConfig {
                    urls: vec![url],
                    username: if is_turn { turn_username.clone() } else { None },
                    credential: if is_turn { turn_credential.clone() } else { None },
                }
            })
            .collect();

        let signaling = SignalingConfig {
            endpoint: lookup("CLASSROOM_SIGNALING_URL")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.signaling.endpoint),
            token: lookup("CLASSROOM_SIGNALING_TOKEN").filter(|s| !s.is_empty()),
            reconnect: RetryPolicy {
                max_attempts: parse_or(
                    &lookup,
                    "CLASSROOM_SIGNALING_RECONNECT_ATTEMPTS",
                    defaults.signaling.reconnect.max_attempts,
                )?,
                ..defaults.signaling.reconnect
            },
        };

        let media = MediaConstraints {
            audio: bool_or(&lookup, "CLASSROOM_AUDIO", defaults.media.audio)?,
            video: bool_or(&lookup, "CLASSROOM_VIDEO", defaults.media.video)?,
        };

        let peer = PeerConfig {
            retry: RetryPolicy {
                max_attempts: parse_or(
                    &lookup,
                    "CLASSROOM_RETRY_MAX_ATTEMPTS",
                    defaults.peer.retry.max_attempts,
                )?,
                initial_backoff: millis_or(
                    &lookup,
                    "CLASSROOM_RETRY_INITIAL_BACKOFF_MS",
                    defaults.peer.retry.initial_backoff,
                )?,
                max_backoff: millis_or(
                    &lookup,
                    "CLASSROOM_RETRY_MAX_BACKOFF_MS",
                    defaults.peer.retry.max_backoff,
                )?,
                multiplier: defaults.peer.retry.multiplier,
            },
            negotiation_timeout: millis_or(
                &lookup,
                "CLASSROOM_NEGOTIATION_TIMEOUT_MS",
                defaults.peer.negotiation_timeout,
            )?,
        };

        let quality = QualityConfig {
            sampling_interval: millis_or(
                &lookup,
                "CLASSROOM_SAMPLING_INTERVAL_MS",
                defaults.quality.sampling_interval,
            )?,
            ..defaults.quality
        };

        let config = Self {
            ice_servers,
            signaling,
            media,
            peer,
            quality,
        };
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quality.sampling_interval.is_zero() {
            return Err(ConfigError::Validation(
                "sampling interval must be non-zero".to_string(),
            ));
        }
        if self.peer.negotiation_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "negotiation timeout must be non-zero".to_string(),
            ));
        }
        for (name, policy) in [
            ("peer retry", &self.peer.retry),
            ("signaling reconnect", &self.signaling.reconnect),
        ] {
            if policy.initial_backoff > policy.max_backoff {
                return Err(ConfigError::Validation(format!(
                    "{name}: initial backoff exceeds max backoff"
                )));
            }
            if policy.multiplier < 1.0 {
                return Err(ConfigError::Validation(format!(
                    "{name}: multiplier must be at least 1.0"
                )));
            }
        }
        if self.quality.upgrade_dwell == 0 || self.quality.downgrade_dwell == 0 {
            return Err(ConfigError::Validation(
                "quality dwell counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn log_summary(&self) {
        tracing::debug!(
            ice_servers = self.ice_servers.len(),
            turn_servers = self.ice_servers.iter().filter(|s| s.is_turn()).count(),
            signaling = %self.signaling.endpoint,
            sampling_ms = self.quality.sampling_interval.as_millis() as u64,
            retry_attempts = self.peer.retry.max_attempts,
            "Conference configuration loaded"
        );
    }
}

const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

fn env_csv<F>(lookup: &F, key: &str, defaults: &[&str]) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => defaults.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(v) if !v.trim().is_empty() => {
            v.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: v,
            })
        }
        _ => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_millis() as u64).map(Duration::from_millis)
}

fn bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            "" => Ok(default),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: v,
            }),
        },
        None => Ok(default),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
