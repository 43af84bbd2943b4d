//! TURN credential provider backed by Cloudflare's TURN API.
//!
//! Credentials are minted with a TTL and cached until expiry; workers and
//! browsers fetch them through `GET /api/webrtc/ice-servers` before each
//! offer. An unconfigured provider reports itself disabled and callers fall
//! back to their own STUN configuration.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rivulet_config::TurnSettings;
use rivulet_proto::IceServer;
use serde::Deserialize;
use tracing::debug;

/// Errors surfaced by credential retrieval.
#[derive(Debug, thiserror::Error)]
pub enum IceError {
    #[error("TURN credentials are not configured")]
    NotConfigured,
    #[error("TURN credential request failed")]
    Request(#[from] reqwest::Error),
    #[error("TURN API returned status {status}")]
    Status { status: u16 },
    #[error("TURN API returned no ice servers")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct CloudflareIceResponse {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<IceServer>,
}

struct CachedServers {
    servers: Vec<IceServer>,
    expires_at: Instant,
}

/// Provider with TTL-scoped caching.
pub struct IceServerProvider {
    settings: TurnSettings,
    client: reqwest::Client,
    cache: Mutex<Option<CachedServers>>,
}

impl IceServerProvider {
    /// Provider over the given settings.
    #[must_use]
    pub fn new(settings: TurnSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(None),
        }
    }

    /// Whether enough configuration is present to mint credentials.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.settings.enabled()
    }

    /// Cached servers with their remaining TTL, or fresh ones when the
    /// cache is cold or expired.
    ///
    /// # Errors
    ///
    /// Returns [`IceError::NotConfigured`] without configuration, and
    /// request/decode failures otherwise.
    pub async fn get(&self) -> Result<(Vec<IceServer>, Duration), IceError> {
        if !self.enabled() {
            return Err(IceError::NotConfigured);
        }

        if let Some((servers, ttl)) = self.cached() {
            debug!(remaining_secs = ttl.as_secs(), "serving cached TURN credentials");
            return Ok((servers, ttl));
        }

        let servers = self.fetch().await?;
        let ttl = Duration::from_secs(self.settings.ttl_secs);
        let mut cache = self.cache.lock().expect("ice cache lock poisoned");
        *cache = Some(CachedServers {
            servers: servers.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok((servers, ttl))
    }

    fn cached(&self) -> Option<(Vec<IceServer>, Duration)> {
        let cache = self.cache.lock().expect("ice cache lock poisoned");
        cache.as_ref().and_then(|entry| {
            let now = Instant::now();
            (entry.expires_at > now)
                .then(|| (entry.servers.clone(), entry.expires_at - now))
        })
    }

    async fn fetch(&self) -> Result<Vec<IceServer>, IceError> {
        let account_id = self.settings.account_id.as_deref().unwrap_or_default();
        let api_token = self.settings.api_token.as_deref().unwrap_or_default();
        let endpoint = format!(
            "https://rtc.live.cloudflare.com/v1/turn/keys/{account_id}/credentials/generate-ice-servers"
        );

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(api_token)
            .json(&serde_json::json!({ "ttl": self.settings.ttl_secs }))
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::CREATED {
            return Err(IceError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: CloudflareIceResponse = response.json().await?;
        if parsed.ice_servers.is_empty() {
            return Err(IceError::Empty);
        }
        Ok(parsed.ice_servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_provider_reports_disabled() {
        let provider = IceServerProvider::new(TurnSettings::default());
        assert!(!provider.enabled());
        assert!(matches!(provider.get().await, Err(IceError::NotConfigured)));
    }

    #[test]
    fn cache_expiry_is_honoured() {
        let provider = IceServerProvider::new(TurnSettings {
            api_token: Some("token".into()),
            account_id: Some("account".into()),
            ttl_secs: 3_600,
        });

        assert!(provider.cached().is_none());
        {
            let mut cache = provider.cache.lock().expect("lock");
            *cache = Some(CachedServers {
                servers: vec![IceServer {
                    urls: vec!["turn:turn.example:3478".into()],
                    username: Some("u".into()),
                    credential: Some("c".into()),
                }],
                expires_at: Instant::now() + Duration::from_secs(100),
            });
        }
        let (servers, ttl) = provider.cached().expect("cache hit");
        assert_eq!(servers.len(), 1);
        assert!(ttl <= Duration::from_secs(100));

        {
            let mut cache = provider.cache.lock().expect("lock");
            cache.as_mut().expect("entry").expires_at = Instant::now() - Duration::from_secs(1);
        }
        assert!(provider.cached().is_none(), "expired entries miss");
    }
}
