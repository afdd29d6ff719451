//! Configuration management

use crate::domain::shared::error::ClientError;
use crate::domain::shared::result::Result;
use crate::infrastructure::transport::KeepAliveKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub user: UserConfig,
    pub transport: TransportConfig,
    pub registration: RegistrationConfig,
    pub call: CallConfig,
    pub conference: ConferenceConfig,
    pub messaging: MessagingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Local address of record, e.g. `sip:alice@example.com`
    pub uri: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket signaling endpoint, e.g. `wss://sip.example.com:7443`
    pub server_url: String,
    pub connection_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub keep_alive: KeepAliveKind,
    pub auto_reconnect: bool,
    pub max_reconnection_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Requested registration interval in seconds
    pub expires: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub dtmf_tone_duration_ms: u64,
    pub dtmf_inter_tone_gap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    pub audio_poll_interval_ms: u64,
    pub default_max_participants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub composing_idle_timeout_secs: u64,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            uri: "sip:anonymous@localhost".to_string(),
            display_name: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://localhost:7443".to_string(),
            connection_timeout_secs: 10,
            keep_alive_interval_secs: 30,
            keep_alive: KeepAliveKind::CrlfPing,
            auto_reconnect: true,
            max_reconnection_attempts: 5,
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            expires: 600,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            dtmf_tone_duration_ms: 100,
            dtmf_inter_tone_gap_ms: 70,
        }
    }
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            audio_poll_interval_ms: 100,
            default_max_participants: 16,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            composing_idle_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    /// Load from a config file, with `WARBLER__`-prefixed environment
    /// variables overriding file values.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("WARBLER").separator("__"))
            .build()
            .map_err(|e| {
                ClientError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        settings.try_deserialize().map_err(|e| {
            ClientError::Configuration(format!("Invalid configuration: {}", e))
        })
    }

    /// Parse from a TOML string.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input)
            .map_err(|e| ClientError::Configuration(format!("Invalid configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.transport.connection_timeout_secs, 10);
        assert_eq!(config.transport.keep_alive_interval_secs, 30);
        assert_eq!(config.transport.max_reconnection_attempts, 5);
        assert_eq!(config.registration.expires, 600);
        assert_eq!(config.registration.max_retries, 3);
        assert_eq!(config.conference.audio_poll_interval_ms, 100);
        assert_eq!(config.messaging.composing_idle_timeout_secs, 10);
    }

    #[test]
    fn test_from_toml_str() {
        let config = EngineConfig::from_toml_str(
            r#"
            [user]
            uri = "sip:alice@example.com"
            display_name = "Alice"

            [transport]
            server_url = "wss://sip.example.com:7443"
            max_reconnection_attempts = 3

            [registration]
            expires = 300
            "#,
        )
        .unwrap();

        assert_eq!(config.user.uri, "sip:alice@example.com");
        assert_eq!(config.transport.server_url, "wss://sip.example.com:7443");
        assert_eq!(config.transport.max_reconnection_attempts, 3);
        assert_eq!(config.registration.expires, 300);
        // Untouched sections keep their defaults
        assert_eq!(config.call.dtmf_tone_duration_ms, 100);
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(EngineConfig::from_toml_str("transport = 42").is_err());
    }
}
