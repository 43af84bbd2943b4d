//! REST surface and router construction.
//!
//! Responses use the `{success, data}` / `{success, error}` envelope the
//! browser client expects. The task-listing handler owns the fan-out
//! deadline: completion wins a 200 with the merged list, the deadline wins a
//! 408 carrying whatever partial responses accumulated.

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use rivulet_proto::{Frame, IceServersResponse, NodeStatus};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::GatewayState;
use crate::correlator::FANOUT_DEADLINE;
use crate::ws;

/// Build the gateway router with its REST and WebSocket endpoints.
#[must_use]
pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{id}", get(node_detail))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/{id}", get(task_detail))
        .route("/api/tasks/submit", post(submit_task))
        .route("/api/status", get(system_status))
        .route("/api/webrtc/ice-servers", get(ice_servers))
        .route("/ws/nodes", get(ws::node_socket))
        .route("/ws/clients", get(ws::client_socket))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn list_nodes(State(state): State<GatewayState>) -> Response {
    let nodes = state.registry.online();
    ok(json!(nodes))
}

async fn node_detail(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(node) => ok(json!(node)),
        None => error(StatusCode::NOT_FOUND, "Node not found"),
    }
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    worker_id: String,
    magnet_url: String,
}

async fn submit_task(
    State(state): State<GatewayState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Response {
    if request.magnet_url.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "magnet_url is required");
    }

    let online = state
        .registry
        .get(&request.worker_id)
        .is_some_and(|node| node.status == NodeStatus::Online);
    if !online {
        return error(StatusCode::NOT_FOUND, "Worker node not available");
    }

    let frame = Frame::TaskSubmit {
        magnet_url: request.magnet_url,
        timestamp: Utc::now().timestamp(),
    };
    match state.hub.send_to_worker(&request.worker_id, frame) {
        Ok(()) => ok(json!({ "message": "Task submitted successfully" })),
        Err(error_value) => {
            warn!(worker_id = %request.worker_id, error = %error_value, "task submission failed");
            error(StatusCode::NOT_FOUND, "Worker node not connected")
        }
    }
}

async fn list_tasks(State(state): State<GatewayState>) -> Response {
    let workers: Vec<String> = state
        .registry
        .online()
        .into_iter()
        .map(|node| node.id)
        .collect();

    let (request_id, mut rx) = state.correlator.begin_fanout(&workers);
    for worker_id in &workers {
        let frame = Frame::GetTasks {
            request_id: request_id.clone(),
            timestamp: Utc::now().timestamp(),
        };
        if let Err(send_error) = state.hub.send_to_worker(worker_id, frame) {
            warn!(worker_id = %worker_id, error = %send_error, "task list request not sent");
            state.correlator.mark_unreachable(&request_id, worker_id);
        }
    }

    match tokio::time::timeout(FANOUT_DEADLINE, rx.recv()).await {
        Ok(Some(tasks)) => ok(json!({ "tasks": tasks })),
        Ok(None) => error(StatusCode::INTERNAL_SERVER_ERROR, "Fan-out aborted"),
        Err(_) => {
            // Deadline: surface what arrived, but never as a success.
            let partial = state.correlator.take_partial(&request_id);
            (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({
                    "success": false,
                    "error": "Request timeout while waiting for worker responses",
                    "data": { "tasks": partial },
                })),
            )
                .into_response()
        }
    }
}

async fn task_detail(State(state): State<GatewayState>, Path(task_id): Path<String>) -> Response {
    let workers: Vec<String> = state
        .registry
        .online()
        .into_iter()
        .map(|node| node.id)
        .collect();

    let mut rx = state.correlator.begin_detail(&task_id, &workers);
    for worker_id in &workers {
        let frame = Frame::GetTaskDetail {
            task_id: task_id.clone(),
            timestamp: Utc::now().timestamp(),
        };
        if let Err(send_error) = state.hub.send_to_worker(worker_id, frame) {
            warn!(worker_id = %worker_id, error = %send_error, "task detail request not sent");
            state.correlator.mark_detail_unreachable(&task_id, worker_id);
        }
    }

    match tokio::time::timeout(FANOUT_DEADLINE, rx.recv()).await {
        Ok(Some(Some(task))) => ok(json!(task)),
        Ok(Some(None)) | Ok(None) => error(StatusCode::NOT_FOUND, "Task not found"),
        Err(_) => error(StatusCode::REQUEST_TIMEOUT, "No worker answered in time"),
    }
}

async fn system_status(State(state): State<GatewayState>) -> Response {
    let (total, online) = state.registry.counts();
    ok(json!({
        "online_nodes": online,
        "total_nodes": total,
        "active_sessions": state.sessions.count(),
    }))
}

async fn ice_servers(State(state): State<GatewayState>) -> Response {
    match state.ice.get().await {
        Ok((servers, ttl)) => Json(IceServersResponse {
            success: true,
            ice_servers: servers,
            ttl: ttl.as_secs(),
            error: None,
        })
        .into_response(),
        Err(ice_error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(IceServersResponse {
                success: false,
                ice_servers: Vec::new(),
                ttl: 0,
                error: Some(ice_error.to_string()),
            }),
        )
            .into_response(),
    }
}

fn ok(data: serde_json::Value) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}
