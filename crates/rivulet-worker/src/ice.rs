//! ICE configuration for outgoing answers.
//!
//! TURN credentials come from the gateway's credential endpoint and are
//! cached until their TTL expires; the composed configuration always leads
//! with the locally configured STUN servers so peer connections keep
//! working when the gateway cannot mint credentials.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rivulet_proto::{IceServer, IceServersResponse};
use tracing::{debug, warn};

/// Default credential lifetime when the gateway omits one.
pub const DEFAULT_TURN_TTL: Duration = Duration::from_secs(60 * 60);

struct CachedTurn {
    servers: Vec<IceServer>,
    expires_at: Instant,
}

/// Per-offer ICE configuration source.
pub struct IceConfigProvider {
    endpoint: Option<String>,
    stun_servers: Vec<String>,
    client: reqwest::Client,
    cache: Mutex<Option<CachedTurn>>,
}

impl IceConfigProvider {
    /// Provider deriving the credential endpoint from the gateway WebSocket
    /// URL and falling back to `stun_servers` from worker configuration.
    #[must_use]
    pub fn new(gateway_ws_url: &str, stun_servers: Vec<String>) -> Self {
        let endpoint = http_base_from_ws_url(gateway_ws_url)
            .map(|base| format!("{base}/api/webrtc/ice-servers"));
        Self {
            endpoint,
            stun_servers,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(None),
        }
    }

    /// Compose the ICE server list for the next offer: configured STUN
    /// servers first, then any TURN credentials the gateway handed out.
    pub async fn ice_servers(&self) -> Vec<IceServer> {
        let turn = match self.turn_servers().await {
            Ok(servers) => servers,
            Err(error) => {
                debug!(error = %error, "TURN credentials unavailable; STUN only");
                Vec::new()
            }
        };
        compose_servers(&self.stun_servers, turn)
    }

    async fn turn_servers(&self) -> Result<Vec<IceServer>, String> {
        {
            let cache = self.cache.lock().expect("ice cache lock poisoned");
            if let Some(entry) = cache.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.servers.clone());
                }
            }
        }

        let Some(endpoint) = self.endpoint.as_deref() else {
            return Err("no credential endpoint derivable from gateway URL".to_string());
        };

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|error| format!("request failed: {error}"))?;
        if !response.status().is_success() {
            return Err(format!("gateway returned status {}", response.status()));
        }
        let payload: IceServersResponse = response
            .json()
            .await
            .map_err(|error| format!("undecodable response: {error}"))?;
        if !payload.success {
            return Err(payload
                .error
                .unwrap_or_else(|| "gateway reported failure".to_string()));
        }

        let ttl = if payload.ttl > 0 {
            Duration::from_secs(payload.ttl)
        } else {
            DEFAULT_TURN_TTL
        };
        let mut cache = self.cache.lock().expect("ice cache lock poisoned");
        *cache = Some(CachedTurn {
            servers: payload.ice_servers.clone(),
            expires_at: Instant::now() + ttl,
        });
        Ok(payload.ice_servers)
    }
}

/// Derive the gateway's HTTP base from its WebSocket URL
/// (`ws://host:port/ws/nodes` → `http://host:port`).
#[must_use]
pub fn http_base_from_ws_url(ws_url: &str) -> Option<String> {
    let (scheme, rest) = ws_url.split_once("://")?;
    let http_scheme = match scheme {
        "ws" => "http",
        "wss" => "https",
        "http" | "https" => scheme,
        other => {
            warn!(scheme = other, "unsupported gateway URL scheme");
            return None;
        }
    };
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{http_scheme}://{host}"))
}

/// Normalise configured STUN entries (bare hosts gain a `stun:` prefix) and
/// append the TURN set.
#[must_use]
pub fn compose_servers(stun_servers: &[String], turn: Vec<IceServer>) -> Vec<IceServer> {
    let mut servers: Vec<IceServer> = stun_servers
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let lowered = entry.to_lowercase();
            let url = if lowered.starts_with("stun:")
                || lowered.starts_with("turn:")
                || lowered.starts_with("turns:")
            {
                entry.to_string()
            } else {
                format!("stun:{entry}")
            };
            Some(IceServer {
                urls: vec![url],
                username: None,
                credential: None,
            })
        })
        .collect();
    servers.extend(turn);
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_translates_to_http_base() {
        assert_eq!(
            http_base_from_ws_url("ws://gateway:8080/ws/nodes").as_deref(),
            Some("http://gateway:8080")
        );
        assert_eq!(
            http_base_from_ws_url("wss://gw.example.com/ws/nodes?x=1").as_deref(),
            Some("https://gw.example.com")
        );
        assert!(http_base_from_ws_url("ftp://gateway/ws").is_none());
        assert!(http_base_from_ws_url("gateway:8080").is_none());
        assert!(http_base_from_ws_url("ws:///ws/nodes").is_none());
    }

    #[test]
    fn composition_normalises_and_appends_turn() {
        let stun = vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun1.l.google.com:19302".to_string(),
            "  ".to_string(),
        ];
        let turn = vec![IceServer {
            urls: vec!["turn:turn.example:3478".into()],
            username: Some("user".into()),
            credential: Some("secret".into()),
        }];

        let servers = compose_servers(&stun, turn);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].urls[0], "stun:stun.l.google.com:19302");
        assert_eq!(servers[1].urls[0], "stun:stun1.l.google.com:19302");
        assert_eq!(servers[2].username.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn provider_falls_back_to_stun_without_endpoint() {
        let provider = IceConfigProvider::new(
            "bad-url",
            vec!["stun:stun.l.google.com:19302".to_string()],
        );
        let servers = provider.ice_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls[0], "stun:stun.l.google.com:19302");
    }

    #[test]
    fn cache_expiry_forces_refetch() {
        let provider = IceConfigProvider::new("ws://gateway:8080/ws/nodes", Vec::new());
        {
            let mut cache = provider.cache.lock().expect("lock");
            *cache = Some(CachedTurn {
                servers: vec![IceServer {
                    urls: vec!["turn:t.example:3478".into()],
                    username: None,
                    credential: None,
                }],
                expires_at: Instant::now() + Duration::from_secs(60),
            });
        }
        {
            let cache = provider.cache.lock().expect("lock");
            assert!(cache.as_ref().expect("entry").expires_at > Instant::now());
        }
        {
            let mut cache = provider.cache.lock().expect("lock");
            cache.as_mut().expect("entry").expires_at = Instant::now() - Duration::from_secs(1);
        }
        let cache = provider.cache.lock().expect("lock");
        assert!(cache.as_ref().expect("entry").expires_at <= Instant::now());
    }
}
