//! WebRTC peer-session manager.
//!
//! One peer-connection per session id, created on inbound offer with a
//! freshly composed ICE configuration. Replacement offers close the prior
//! connection before the new remote description is applied; candidates
//! arriving before the connection exists are buffered and flushed after
//! `set_remote_description`. Only data channels labelled
//! `filePathChannel` are accepted, and their messages feed the file server.

pub mod file_server;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rivulet_proto::IceServer;
use rivulet_proto::channel::CHANNEL_LABEL;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use file_server::{FileServer, ServeOutcome};

/// Signals the manager pushes back toward the gateway link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate for a session.
    IceCandidate {
        session_id: String,
        candidate: String,
    },
}

/// One live peer-connection.
pub struct PeerSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pc: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
}

#[derive(Default)]
struct PeerState {
    sessions: HashMap<String, PeerSession>,
    buffered_candidates: HashMap<String, Vec<RTCIceCandidateInit>>,
}

/// Peer-connection factory and session table.
pub struct PeerManager {
    api: API,
    state: Mutex<PeerState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    file_server: Arc<FileServer>,
}

impl PeerManager {
    /// Build a manager over the given file server; `events_tx` carries
    /// gathered candidates back to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error when the WebRTC engine cannot be assembled.
    pub fn new(
        file_server: Arc<FileServer>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("failed to register codecs")?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .context("failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Arc::new(Self {
            api,
            state: Mutex::new(PeerState::default()),
            events_tx,
            file_server,
        }))
    }

    /// Handle an inbound offer: replace any existing connection for the
    /// session, run the answer flow, and return the answer SDP.
    ///
    /// # Errors
    ///
    /// Returns an error when the SDP is unusable or the engine refuses the
    /// connection.
    pub async fn handle_offer(
        self: &Arc<Self>,
        session_id: &str,
        sdp: &str,
        ice_servers: Vec<IceServer>,
    ) -> anyhow::Result<String> {
        // Replace semantics: the prior connection closes before the new
        // remote description is applied, so none of its candidates leak.
        let prior = {
            let mut state = self.state.lock().await;
            state.sessions.remove(session_id)
        };
        if let Some(prior) = prior {
            info!(session_id = %session_id, "closing replaced peer connection");
            let _ = prior.pc.close().await;
        }

        let config = RTCConfiguration {
            ice_servers: ice_servers.into_iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("failed to create peer connection")?,
        );

        self.install_handlers(session_id, &pc);

        let offer =
            RTCSessionDescription::offer(sdp.to_string()).context("unusable offer SDP")?;
        pc.set_remote_description(offer)
            .await
            .context("failed to set remote description")?;

        // Flush candidates that raced ahead of the offer.
        let buffered = {
            let mut state = self.state.lock().await;
            state
                .buffered_candidates
                .remove(session_id)
                .unwrap_or_default()
        };
        for candidate in buffered {
            if let Err(error) = pc.add_ice_candidate(candidate).await {
                warn!(session_id = %session_id, error = %error, "buffered candidate rejected");
            }
        }

        let answer = pc
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        pc.set_local_description(answer.clone())
            .await
            .context("failed to set local description")?;

        {
            let mut state = self.state.lock().await;
            state.sessions.insert(
                session_id.to_string(),
                PeerSession {
                    session_id: session_id.to_string(),
                    created_at: Utc::now(),
                    pc,
                    data_channel: None,
                },
            );
        }
        info!(session_id = %session_id, "peer connection answered");
        Ok(answer.sdp)
    }

    /// Apply (or buffer) a remote ICE candidate for a session.
    ///
    /// # Errors
    ///
    /// Returns an error when a live connection rejects the candidate.
    pub async fn add_ice_candidate(
        &self,
        session_id: &str,
        candidate: &str,
    ) -> anyhow::Result<()> {
        let init = parse_candidate(candidate);

        let pc = {
            let mut state = self.state.lock().await;
            match state.sessions.get(session_id) {
                Some(session) => Arc::clone(&session.pc),
                None => {
                    debug!(session_id = %session_id, "buffering candidate before offer");
                    state
                        .buffered_candidates
                        .entry(session_id.to_string())
                        .or_default()
                        .push(init);
                    return Ok(());
                }
            }
        };
        pc.add_ice_candidate(init)
            .await
            .context("failed to add ICE candidate")
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Whether a session currently holds a peer connection.
    pub async fn has_session(&self, session_id: &str) -> bool {
        self.state.lock().await.sessions.contains_key(session_id)
    }

    /// Drop one session, closing its connection.
    pub async fn remove_session(&self, session_id: &str) {
        let session = {
            let mut state = self.state.lock().await;
            state.buffered_candidates.remove(session_id);
            state.sessions.remove(session_id)
        };
        if let Some(session) = session {
            let _ = session.pc.close().await;
            info!(session_id = %session_id, "peer session removed");
        }
    }

    /// Close every peer connection.
    pub async fn close_all(&self) {
        let sessions: Vec<PeerSession> = {
            let mut state = self.state.lock().await;
            state.buffered_candidates.clear();
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            let _ = session.pc.close().await;
        }
    }

    fn install_handlers(self: &Arc<Self>, session_id: &str, pc: &Arc<RTCPeerConnection>) {
        let manager = Arc::clone(self);
        let id = session_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            Box::pin(async move {
                debug!(session_id = %id, state = %state, "peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    manager.remove_session(&id).await;
                }
            })
        }));

        let events_tx = self.events_tx.clone();
        let id = session_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events_tx = events_tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events_tx.send(PeerEvent::IceCandidate {
                            session_id: id,
                            candidate: init.candidate,
                        });
                    }
                    Err(error) => {
                        warn!(session_id = %id, error = %error, "candidate not serialisable");
                    }
                }
            })
        }));

        let manager = Arc::clone(self);
        let id = session_id.to_string();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let manager = Arc::clone(&manager);
            let id = id.clone();
            Box::pin(async move {
                if channel.label() != CHANNEL_LABEL {
                    debug!(
                        session_id = %id,
                        label = channel.label(),
                        "ignoring unexpected data channel"
                    );
                    return;
                }
                info!(session_id = %id, "file channel accepted");
                manager.bind_channel(&id, channel).await;
            })
        }));
    }

    async fn bind_channel(self: &Arc<Self>, session_id: &str, channel: Arc<RTCDataChannel>) {
        {
            let mut state = self.state.lock().await;
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.data_channel = Some(Arc::clone(&channel));
            }
        }

        let server = Arc::clone(&self.file_server);
        let reply_channel = Arc::clone(&channel);
        let id = session_id.to_string();
        channel.on_message(Box::new(move |message| {
            let server = Arc::clone(&server);
            let reply_channel = Arc::clone(&reply_channel);
            let id = id.clone();
            Box::pin(async move {
                match server.respond(&message.data).await {
                    ServeOutcome::Silent => {}
                    ServeOutcome::Frames(frames) => {
                        for frame in frames {
                            if let Err(error) = reply_channel.send_text(frame).await {
                                warn!(session_id = %id, error = %error, "chunk send failed");
                                break;
                            }
                        }
                    }
                }
            })
        }));
    }
}

fn to_rtc_ice_server(server: IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls,
        username: server.username.unwrap_or_default(),
        credential: server.credential.unwrap_or_default(),
        ..Default::default()
    }
}

#[derive(Debug, Deserialize)]
struct CandidateJson {
    candidate: String,
    #[serde(rename = "sdpMid")]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
}

/// Browsers send either the raw candidate attribute or its JSON wrapper.
fn parse_candidate(raw: &str) -> RTCIceCandidateInit {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<CandidateJson>(trimmed) {
            return RTCIceCandidateInit {
                candidate: parsed.candidate,
                sdp_mid: parsed.sdp_mid,
                sdp_mline_index: parsed.sdp_mline_index,
                ..Default::default()
            };
        }
    }
    RTCIceCandidateInit {
        candidate: raw.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn candidate_parsing_accepts_raw_and_json_forms() {
        let raw = parse_candidate("candidate:1 1 UDP 2122252543 10.0.0.5 53533 typ host");
        assert!(raw.candidate.starts_with("candidate:1"));
        assert!(raw.sdp_mid.is_none());

        let json = parse_candidate(
            r#"{"candidate":"candidate:2 1 UDP 1 10.0.0.6 4 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        );
        assert!(json.candidate.starts_with("candidate:2"));
        assert_eq!(json.sdp_mid.as_deref(), Some("0"));
        assert_eq!(json.sdp_mline_index, Some(0));

        // Malformed JSON degrades to the raw form rather than failing.
        let degraded = parse_candidate("{not json");
        assert_eq!(degraded.candidate, "{not json");
    }

    fn manager() -> Arc<PeerManager> {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        PeerManager::new(
            Arc::new(FileServer::new(PathBuf::from("data/m3u8"))),
            events_tx,
        )
        .expect("manager")
    }

    async fn client_offer() -> (Arc<RTCPeerConnection>, String) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().expect("codecs");
        let registry = register_default_interceptors(Default::default(), &mut media_engine)
            .expect("interceptors");
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("client pc"),
        );
        let _channel = pc
            .create_data_channel(CHANNEL_LABEL, None)
            .await
            .expect("data channel");
        let offer = pc.create_offer(None).await.expect("offer");
        pc.set_local_description(offer.clone())
            .await
            .expect("local description");
        (pc, offer.sdp)
    }

    #[tokio::test]
    async fn offer_produces_answer_and_session() {
        let manager = manager();
        let (client_pc, offer_sdp) = client_offer().await;

        let answer = manager
            .handle_offer("S1", &offer_sdp, Vec::new())
            .await
            .expect("answer");
        assert!(answer.contains("v="), "answer is SDP");
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.has_session("S1").await);

        manager.close_all().await;
        let _ = client_pc.close().await;
    }

    #[tokio::test]
    async fn replacement_offer_keeps_a_single_session() {
        let manager = manager();
        let (first_pc, first_offer) = client_offer().await;
        let (second_pc, second_offer) = client_offer().await;

        manager
            .handle_offer("S1", &first_offer, Vec::new())
            .await
            .expect("first answer");
        manager
            .handle_offer("S1", &second_offer, Vec::new())
            .await
            .expect("second answer");

        assert_eq!(
            manager.session_count().await,
            1,
            "at most one peer connection per session id"
        );

        manager.close_all().await;
        let _ = first_pc.close().await;
        let _ = second_pc.close().await;
    }

    #[tokio::test]
    async fn candidates_buffer_until_the_offer_arrives() {
        let manager = manager();

        manager
            .add_ice_candidate("S1", "candidate:1 1 UDP 1 10.0.0.5 4 typ host")
            .await
            .expect("buffered");
        {
            let state = manager.state.lock().await;
            assert_eq!(
                state
                    .buffered_candidates
                    .get("S1")
                    .map(Vec::len)
                    .unwrap_or_default(),
                1
            );
        }

        let (client_pc, offer_sdp) = client_offer().await;
        manager
            .handle_offer("S1", &offer_sdp, Vec::new())
            .await
            .expect("answer");
        {
            let state = manager.state.lock().await;
            assert!(
                !state.buffered_candidates.contains_key("S1"),
                "buffer flushed after set_remote_description"
            );
        }

        manager.close_all().await;
        let _ = client_pc.close().await;
    }

    #[tokio::test]
    async fn remove_session_discards_connection_and_buffer() {
        let manager = manager();
        let (client_pc, offer_sdp) = client_offer().await;
        manager
            .handle_offer("S1", &offer_sdp, Vec::new())
            .await
            .expect("answer");

        manager.remove_session("S1").await;
        assert_eq!(manager.session_count().await, 0);
        assert!(!manager.has_session("S1").await);

        let _ = client_pc.close().await;
    }
}
