//! WebSocket endpoints for workers (`/ws/nodes`) and clients
//! (`/ws/clients?client_id=<id>`).
//!
//! Each connection runs one reader loop in its upgrade task and one writer
//! task draining the hub queue, so outbound frames stay ordered per
//! connection. The first worker frame must be the bare registration record
//! and must arrive within the handshake deadline.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rivulet_proto::{Frame, NodeRecord};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::GatewayState;
use crate::hub::ConnectionHandle;
use crate::relay;

/// Deadline for the registration frame on a fresh worker socket.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Upgrade handler for worker connections.
pub async fn node_socket(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_node_socket(socket, state))
}

async fn handle_node_socket(socket: WebSocket, state: GatewayState) {
    let (sink, mut stream) = socket.split();

    // Registration is the one non-enveloped frame in the protocol.
    let record = match read_registration(&mut stream).await {
        Some(record) => record,
        None => return,
    };
    let node_id = record.id.clone();

    state.registry.register(record);
    let (handle, rx) = ConnectionHandle::channel();
    state.hub.attach_worker(&node_id, handle.clone());
    let writer = spawn_writer(sink, rx);
    info!(node_id = %node_id, "worker connected");

    let confirmed = state.hub.send_to_worker(
        &node_id,
        Frame::RegistrationConfirmed {
            node_id: node_id.clone(),
            status: "registered".to_string(),
        },
    );
    if let Err(error) = confirmed {
        warn!(node_id = %node_id, error = %error, "failed to queue registration confirmation");
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(frame) => relay::handle_node_frame(&state, &node_id, frame),
                Err(error) => {
                    warn!(node_id = %node_id, error = %error, "unparseable worker frame dropped");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // The hub entry clears immediately; the registry record lags until the
    // sweep marks it offline and eventually evicts it.
    info!(node_id = %node_id, "worker disconnected");
    state.hub.detach_worker(&node_id);
    state.correlator.worker_disconnected(&node_id);
    writer.abort();
}

async fn read_registration(stream: &mut SplitStream<WebSocket>) -> Option<NodeRecord> {
    let first = tokio::time::timeout(HANDSHAKE_DEADLINE, stream.next()).await;
    match first {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<NodeRecord>(text.as_str())
        {
            Ok(record) if !record.id.is_empty() => Some(record),
            Ok(_) => {
                warn!("worker registration with empty id rejected");
                None
            }
            Err(error) => {
                warn!(error = %error, "malformed worker registration rejected");
                None
            }
        },
        Ok(_) => {
            warn!("worker connection closed before registration");
            None
        }
        Err(_) => {
            warn!("worker registration handshake timed out");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientQuery {
    #[serde(default)]
    client_id: String,
}

/// Upgrade handler for client connections.
pub async fn client_socket(
    ws: WebSocketUpgrade,
    Query(query): Query<ClientQuery>,
    State(state): State<GatewayState>,
) -> Response {
    if query.client_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "client_id is required").into_response();
    }
    ws.on_upgrade(move |socket| handle_client_socket(socket, query.client_id, state))
        .into_response()
}

async fn handle_client_socket(socket: WebSocket, client_id: String, state: GatewayState) {
    let (sink, mut stream) = socket.split();
    let (handle, rx) = ConnectionHandle::channel();
    state.hub.attach_client(&client_id, handle);
    let writer = spawn_writer(sink, rx);
    info!(client_id = %client_id, "client connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(text.as_str()) {
                Ok(frame) => relay::handle_client_frame(&state, &client_id, frame),
                Err(error) => {
                    warn!(client_id = %client_id, error = %error, "unparseable client frame dropped");
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Sessions referencing this client stay alive until the 1 h sweep.
    info!(client_id = %client_id, "client disconnected");
    state.hub.detach_client(&client_id);
    writer.abort();
}

fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let raw = match serde_json::to_string(&frame) {
                Ok(raw) => raw,
                Err(error) => {
                    debug!(error = %error, "failed to serialise outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(raw.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}
