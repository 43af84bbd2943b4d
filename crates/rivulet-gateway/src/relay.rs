//! Frame routing between connected workers and clients.
//!
//! The relay never inspects SDP: offers, answers, and candidates pass
//! through verbatim apart from the payload rewrite on client offers
//! (server-chosen session id plus authenticated client id). Frames for
//! unknown sessions are logged and dropped.

use rivulet_proto::Frame;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::GatewayState;
use crate::sessions::SessionStatus;

/// Handle one enveloped frame from a worker connection.
pub fn handle_node_frame(state: &GatewayState, node_id: &str, frame: Frame) {
    match frame {
        Frame::Heartbeat { .. } => {
            if state.registry.heartbeat(node_id).is_err() {
                warn!(node_id = %node_id, "heartbeat from unregistered worker ignored");
            }
        }
        Frame::TaskStatus {
            task_id,
            status,
            progress,
            ..
        } => {
            info!(
                node_id = %node_id,
                task_id = %task_id,
                status = %status,
                progress,
                "task status update"
            );
        }
        Frame::TasksResponse { request_id, tasks } => {
            state.correlator.record_tasks(&request_id, node_id, tasks);
        }
        Frame::TaskDetailResponse {
            task_id,
            found,
            task,
        } => {
            state.correlator.record_detail(&task_id, node_id, found, task);
        }
        Frame::WebrtcAnswer { session_id, sdp } => {
            let Some(session) = state.sessions.get(&session_id) else {
                warn!(session_id = %session_id, "answer for unknown session dropped");
                return;
            };
            if let Err(error) = state
                .sessions
                .update_status(&session_id, SessionStatus::Connected)
            {
                debug!(session_id = %session_id, error = %error, "session status not advanced");
            }
            state
                .hub
                .send_to_client(&session.client_id, Frame::WebrtcAnswer { session_id, sdp });
        }
        Frame::IceCandidate {
            session_id,
            candidate,
        } => {
            let Some(session) = state.sessions.get(&session_id) else {
                warn!(session_id = %session_id, "candidate for unknown session dropped");
                return;
            };
            state.hub.send_to_client(
                &session.client_id,
                Frame::IceCandidate {
                    session_id,
                    candidate,
                },
            );
        }
        other => {
            warn!(node_id = %node_id, kind = other.kind(), "unexpected frame from worker");
        }
    }
}

/// Handle one enveloped frame from a client connection.
pub fn handle_client_frame(state: &GatewayState, client_id: &str, frame: Frame) {
    match frame {
        Frame::WebrtcOffer {
            session_id,
            worker_id,
            sdp,
            ..
        } => {
            let Some(worker_id) = worker_id else {
                warn!(client_id = %client_id, "offer without worker_id dropped");
                return;
            };
            if !state.hub.worker_connected(&worker_id) {
                warn!(client_id = %client_id, worker_id = %worker_id, "offer for unconnected worker dropped");
                return;
            }

            let session_id = session_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("session_{}", Uuid::new_v4().simple()));
            let session = state.sessions.create(&session_id, client_id, &worker_id);
            info!(
                session_id = %session.session_id,
                client_id = %client_id,
                worker_id = %worker_id,
                "signaling session created"
            );

            let forwarded = Frame::WebrtcOffer {
                session_id: Some(session.session_id.clone()),
                worker_id: None,
                client_id: Some(client_id.to_string()),
                sdp,
            };
            if let Err(error) = state.hub.send_to_worker(&worker_id, forwarded) {
                warn!(worker_id = %worker_id, error = %error, "failed to forward offer");
            }
        }
        Frame::IceCandidate {
            session_id,
            candidate,
        } => {
            let Some(session) = state.sessions.get(&session_id) else {
                warn!(session_id = %session_id, "candidate for unknown session dropped");
                return;
            };
            let forwarded = Frame::IceCandidate {
                session_id,
                candidate,
            };
            if let Err(error) = state.hub.send_to_worker(&session.worker_id, forwarded) {
                debug!(worker_id = %session.worker_id, error = %error, "candidate not deliverable");
            }
        }
        other => {
            warn!(client_id = %client_id, kind = other.kind(), "unexpected frame from client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ConnectionHandle;
    use rivulet_config::GatewayAppConfig;

    fn state() -> GatewayState {
        GatewayState::new(&GatewayAppConfig::default())
    }

    #[tokio::test]
    async fn client_offer_creates_session_and_rewrites_payload() {
        let state = state();
        let (handle, mut worker_rx) = ConnectionHandle::channel();
        state.hub.attach_worker("w1", handle);

        handle_client_frame(
            &state,
            "c1",
            Frame::WebrtcOffer {
                session_id: None,
                worker_id: Some("w1".into()),
                client_id: None,
                sdp: "v=0 offer".into(),
            },
        );

        match worker_rx.recv().await {
            Some(Frame::WebrtcOffer {
                session_id: Some(session_id),
                client_id: Some(client_id),
                worker_id,
                sdp,
            }) => {
                assert_eq!(client_id, "c1");
                assert!(worker_id.is_none(), "worker routing field is stripped");
                assert_eq!(sdp, "v=0 offer");
                let session = state.sessions.get(&session_id).expect("session exists");
                assert_eq!(session.client_id, "c1");
                assert_eq!(session.worker_id, "w1");
                assert_eq!(session.status, SessionStatus::Negotiating);
            }
            other => panic!("expected rewritten offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_supplied_session_ids_are_kept() {
        let state = state();
        let (handle, mut worker_rx) = ConnectionHandle::channel();
        state.hub.attach_worker("w1", handle);

        handle_client_frame(
            &state,
            "c1",
            Frame::WebrtcOffer {
                session_id: Some("S1".into()),
                worker_id: Some("w1".into()),
                client_id: None,
                sdp: "v=0".into(),
            },
        );

        match worker_rx.recv().await {
            Some(Frame::WebrtcOffer { session_id, .. }) => {
                assert_eq!(session_id.as_deref(), Some("S1"));
            }
            other => panic!("expected offer, got {other:?}"),
        }
        assert!(state.sessions.get("S1").is_some());
    }

    #[tokio::test]
    async fn answer_routes_to_client_and_connects_session() {
        let state = state();
        let (handle, mut client_rx) = ConnectionHandle::channel();
        state.hub.attach_client("c1", handle);
        state.sessions.create("S1", "c1", "w1");

        handle_node_frame(
            &state,
            "w1",
            Frame::WebrtcAnswer {
                session_id: "S1".into(),
                sdp: "v=0 answer".into(),
            },
        );

        match client_rx.recv().await {
            Some(Frame::WebrtcAnswer { session_id, sdp }) => {
                assert_eq!(session_id, "S1");
                assert_eq!(sdp, "v=0 answer");
            }
            other => panic!("expected answer, got {other:?}"),
        }
        assert_eq!(
            state.sessions.get("S1").expect("session").status,
            SessionStatus::Connected
        );
    }

    #[tokio::test]
    async fn candidates_route_by_producing_side() {
        let state = state();
        let (worker_handle, mut worker_rx) = ConnectionHandle::channel();
        let (client_handle, mut client_rx) = ConnectionHandle::channel();
        state.hub.attach_worker("w1", worker_handle);
        state.hub.attach_client("c1", client_handle);
        state.sessions.create("S1", "c1", "w1");

        handle_client_frame(
            &state,
            "c1",
            Frame::IceCandidate {
                session_id: "S1".into(),
                candidate: "candidate:client".into(),
            },
        );
        handle_node_frame(
            &state,
            "w1",
            Frame::IceCandidate {
                session_id: "S1".into(),
                candidate: "candidate:worker".into(),
            },
        );

        match worker_rx.recv().await {
            Some(Frame::IceCandidate { candidate, .. }) => {
                assert_eq!(candidate, "candidate:client");
            }
            other => panic!("expected client candidate at worker, got {other:?}"),
        }
        match client_rx.recv().await {
            Some(Frame::IceCandidate { candidate, .. }) => {
                assert_eq!(candidate, "candidate:worker");
            }
            other => panic!("expected worker candidate at client, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_sessions_are_dropped() {
        let state = state();
        let (handle, mut client_rx) = ConnectionHandle::channel();
        state.hub.attach_client("c1", handle);

        handle_node_frame(
            &state,
            "w1",
            Frame::WebrtcAnswer {
                session_id: "S404".into(),
                sdp: "v=0".into(),
            },
        );
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offer_for_unconnected_worker_is_dropped() {
        let state = state();
        handle_client_frame(
            &state,
            "c1",
            Frame::WebrtcOffer {
                session_id: Some("S1".into()),
                worker_id: Some("w-away".into()),
                client_id: None,
                sdp: "v=0".into(),
            },
        );
        assert!(state.sessions.get("S1").is_none(), "no session is created");
    }

    #[test]
    fn heartbeat_refreshes_registered_worker() {
        let state = state();
        state.registry.register(rivulet_proto::NodeRecord {
            id: "w1".into(),
            name: "w1".into(),
            address: "addr".into(),
            status: rivulet_proto::NodeStatus::Online,
            capabilities: Vec::new(),
            resources: Default::default(),
            metadata: Default::default(),
        });

        handle_node_frame(
            &state,
            "w1",
            Frame::Heartbeat {
                timestamp: 0,
                node_id: "w1".into(),
            },
        );
        assert_eq!(state.registry.online().len(), 1);

        // Unknown workers are ignored without creating a record.
        handle_node_frame(
            &state,
            "ghost",
            Frame::Heartbeat {
                timestamp: 0,
                node_id: "ghost".into(),
            },
        );
        assert!(state.registry.get("ghost").is_none());
    }
}
