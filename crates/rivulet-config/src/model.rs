//! Typed configuration models with defaults and validation.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, Result};

/// Complete worker-node configuration, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub network: NetworkSettings,
}

/// Identity advertised during registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    pub name: String,
    pub address: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        let suffix: String = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id: format!("worker-{suffix}"),
            name: format!("rivulet-worker-{suffix}"),
            address: "localhost".to_string(),
        }
    }
}

/// Gateway link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub url: String,
    pub reconnect_delay_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/nodes".to_string(),
            reconnect_delay_secs: 5,
            heartbeat_secs: 30,
        }
    }
}

impl GatewaySettings {
    /// Delay between reconnect attempts.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Interval between heartbeat frames.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// On-disk layout of downloaded and transcoded media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Raw torrent payloads land here, one directory per torrent.
    pub download_path: PathBuf,
    /// Playlists, segments, and subtitles land here, one directory per
    /// video stem.
    pub playlist_path: PathBuf,
    /// Task state store directory.
    pub state_path: PathBuf,
    /// Directory scanned for external subtitle files; defaults to the
    /// transcode input's parent directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_scan_dir: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("data/downloads"),
            playlist_path: PathBuf::from("data/m3u8"),
            state_path: PathBuf::from("data/config"),
            subtitle_scan_dir: None,
        }
    }
}

impl StorageSettings {
    /// Directories that must exist before the worker starts.
    #[must_use]
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.download_path.clone(),
            self.playlist_path.clone(),
            self.state_path.clone(),
        ]
    }
}

/// Concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    pub max_downloads: usize,
    pub max_transcodes: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_downloads: 5,
            max_transcodes: 3,
        }
    }
}

/// Peer-connection fallback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub stun_servers: Vec<String>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl WorkerConfig {
    /// Validate invariants the rest of the worker relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "node.id",
                reason: "must not be empty",
            });
        }
        if !self.gateway.url.starts_with("ws://") && !self.gateway.url.starts_with("wss://") {
            return Err(ConfigError::Invalid {
                field: "gateway.url",
                reason: "must be a ws:// or wss:// URL",
            });
        }
        if self.gateway.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "gateway.heartbeat_secs",
                reason: "must be positive",
            });
        }
        if self.limits.max_downloads == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_downloads",
                reason: "must be positive",
            });
        }
        if self.limits.max_transcodes == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_transcodes",
                reason: "must be positive",
            });
        }
        if self.storage.download_path.as_os_str().is_empty()
            || self.storage.playlist_path.as_os_str().is_empty()
            || self.storage.state_path.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "storage",
                reason: "paths must not be empty",
            });
        }
        Ok(())
    }
}

/// Gateway process configuration, sourced from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayAppConfig {
    pub bind_addr: IpAddr,
    pub http_port: u16,
    pub turn: TurnSettings,
}

/// Cloudflare TURN credential provider settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnSettings {
    pub api_token: Option<String>,
    pub account_id: Option<String>,
    pub ttl_secs: u64,
}

impl TurnSettings {
    /// Whether enough configuration is present to mint TURN credentials.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.api_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.account_id.as_deref().is_some_and(|a| !a.is_empty())
    }
}

impl Default for GatewayAppConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            http_port: 8080,
            turn: TurnSettings {
                api_token: None,
                account_id: None,
                ttl_secs: 3_600,
            },
        }
    }
}

impl GatewayAppConfig {
    /// Build gateway settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an override fails to parse.
    pub fn from_env() -> Result<Self> {
        Self::from_values(
            std::env::var("RIVULET_BIND_ADDR").ok(),
            std::env::var("RIVULET_HTTP_PORT").ok(),
            std::env::var("CLOUDFLARE_TURN_API_TOKEN").ok(),
            std::env::var("CLOUDFLARE_ACCOUNT_ID").ok(),
            std::env::var("CLOUDFLARE_TURN_TTL").ok(),
        )
    }

    fn from_values(
        bind_addr: Option<String>,
        http_port: Option<String>,
        turn_token: Option<String>,
        turn_account: Option<String>,
        turn_ttl: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = bind_addr {
            config.bind_addr = raw.parse().map_err(|_| ConfigError::Invalid {
                field: "RIVULET_BIND_ADDR",
                reason: "not an IP address",
            })?;
        }
        if let Some(raw) = http_port {
            config.http_port = raw.parse().map_err(|_| ConfigError::Invalid {
                field: "RIVULET_HTTP_PORT",
                reason: "not a port number",
            })?;
        }
        config.turn.api_token = turn_token.filter(|t| !t.is_empty());
        config.turn.account_id = turn_account.filter(|a| !a.is_empty());
        if let Some(raw) = turn_ttl {
            match raw.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.turn.ttl_secs = parsed,
                _ => {
                    return Err(ConfigError::Invalid {
                        field: "CLOUDFLARE_TURN_TTL",
                        reason: "not a positive integer",
                    });
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = WorkerConfig::default();
        config.validate().expect("default config must be valid");
        assert_eq!(config.limits.max_downloads, 5);
        assert_eq!(config.limits.max_transcodes, 3);
        assert_eq!(config.gateway.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn generated_node_ids_are_unique() {
        let first = NodeSettings::default();
        let second = NodeSettings::default();
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("worker-"));
    }

    #[test]
    fn validation_rejects_bad_fields() {
        let mut config = WorkerConfig::default();
        config.gateway.url = "http://localhost:8080".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "gateway.url",
                ..
            })
        ));

        let mut config = WorkerConfig::default();
        config.limits.max_downloads = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.node.id = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_config_parses_overrides() {
        let config = GatewayAppConfig::from_values(
            Some("127.0.0.1".into()),
            Some("9090".into()),
            Some("token".into()),
            Some("account".into()),
            Some("600".into()),
        )
        .expect("valid values");
        assert_eq!(config.bind_addr, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.http_port, 9090);
        assert!(config.turn.enabled());
        assert_eq!(config.turn.ttl_secs, 600);
    }

    #[test]
    fn gateway_config_rejects_invalid_overrides() {
        assert!(GatewayAppConfig::from_values(Some("not-an-ip".into()), None, None, None, None)
            .is_err());
        assert!(GatewayAppConfig::from_values(None, Some("99999999".into()), None, None, None)
            .is_err());
        assert!(
            GatewayAppConfig::from_values(None, None, None, None, Some("0".into())).is_err()
        );
    }

    #[test]
    fn turn_requires_both_credentials() {
        let config =
            GatewayAppConfig::from_values(None, None, Some("token".into()), None, None)
                .expect("values parse");
        assert!(!config.turn.enabled());
    }
}
