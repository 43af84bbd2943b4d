//! Wire protocol shared across the Rivulet processes.
//!
//! Every WebSocket frame after worker registration is an envelope of the
//! form `{"type": ..., "payload": {...}}`; [`Frame`] models the complete set
//! as a tagged enum so both sides get parse-or-reject semantics for free.
//! The peer data-channel protocol lives in [`channel`], task DTOs in
//! [`tasks`].

pub mod channel;
pub mod tasks;

use std::collections::BTreeMap;

use rivulet_events::TaskStatus;
use serde::{Deserialize, Serialize};

pub use tasks::{TaskDetail, TaskFileInfo, TaskSummary};

/// Liveness states a worker record moves through on the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// Worker registration record.
///
/// Sent bare (not enveloped) as the first frame of a worker connection, and
/// echoed back by the gateway's REST surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Enveloped frames exchanged over the gateway's WebSocket endpoints.
///
/// A single enum covers both directions and both populations (workers and
/// clients); each handler matches the subset it understands and logs the
/// rest. Serialisation yields the `{type, payload}` shape verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    /// Worker → gateway liveness refresh.
    Heartbeat { timestamp: i64, node_id: String },
    /// Worker → gateway task lifecycle notification.
    TaskStatus {
        task_id: String,
        status: TaskStatus,
        progress: u8,
        timestamp: i64,
    },
    /// Worker → gateway answer to a `get_tasks` broadcast.
    TasksResponse {
        request_id: String,
        tasks: Vec<TaskSummary>,
    },
    /// Worker → gateway answer to a `get_task_detail` probe.
    TaskDetailResponse {
        task_id: String,
        found: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskDetail>,
    },
    /// Worker → gateway → client SDP answer.
    WebrtcAnswer { session_id: String, sdp: String },
    /// Trickle ICE, relayed in either direction.
    IceCandidate {
        session_id: String,
        candidate: String,
    },
    /// Gateway → worker acknowledgement of the registration frame.
    RegistrationConfirmed { node_id: String, status: String },
    /// Gateway → worker magnet submission.
    TaskSubmit { magnet_url: String, timestamp: i64 },
    /// Gateway → worker task list broadcast.
    GetTasks { request_id: String, timestamp: i64 },
    /// Gateway → worker single-task probe.
    GetTaskDetail { task_id: String, timestamp: i64 },
    /// Client → gateway → worker SDP offer. The client names a `worker_id`;
    /// the gateway rewrites the payload with the server-chosen `session_id`
    /// and authenticated `client_id` before forwarding.
    WebrtcOffer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        sdp: String,
    },
}

impl Frame {
    /// Wire discriminator, mirroring the serde tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Heartbeat { .. } => "heartbeat",
            Frame::TaskStatus { .. } => "task_status",
            Frame::TasksResponse { .. } => "tasks_response",
            Frame::TaskDetailResponse { .. } => "task_detail_response",
            Frame::WebrtcAnswer { .. } => "webrtc_answer",
            Frame::IceCandidate { .. } => "ice_candidate",
            Frame::RegistrationConfirmed { .. } => "registration_confirmed",
            Frame::TaskSubmit { .. } => "task_submit",
            Frame::GetTasks { .. } => "get_tasks",
            Frame::GetTaskDetail { .. } => "get_task_detail",
            Frame::WebrtcOffer { .. } => "webrtc_offer",
        }
    }
}

/// ICE server entry returned by the gateway's credential endpoint, shaped
/// for direct consumption by browser and worker peer connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Body of `GET /api/webrtc/ice-servers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServersResponse {
    pub success: bool,
    #[serde(default, rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let raw = serde_json::to_string(frame).expect("serialize frame");
        serde_json::from_str(&raw).expect("deserialize frame")
    }

    #[test]
    fn frames_round_trip_structurally() {
        let frames = vec![
            Frame::Heartbeat {
                timestamp: 1_700_000_000,
                node_id: "w1".into(),
            },
            Frame::TaskStatus {
                task_id: "task_7".into(),
                status: rivulet_events::TaskStatus::Downloading,
                progress: 42,
                timestamp: 1_700_000_001,
            },
            Frame::TasksResponse {
                request_id: "R1".into(),
                tasks: vec![],
            },
            Frame::TaskDetailResponse {
                task_id: "task_7".into(),
                found: false,
                task: None,
            },
            Frame::WebrtcAnswer {
                session_id: "S1".into(),
                sdp: "v=0".into(),
            },
            Frame::IceCandidate {
                session_id: "S1".into(),
                candidate: "candidate:1".into(),
            },
            Frame::RegistrationConfirmed {
                node_id: "w1".into(),
                status: "registered".into(),
            },
            Frame::TaskSubmit {
                magnet_url: "magnet:?xt=urn:btih:AAA".into(),
                timestamp: 1_700_000_002,
            },
            Frame::GetTasks {
                request_id: "R2".into(),
                timestamp: 1_700_000_003,
            },
            Frame::GetTaskDetail {
                task_id: "task_9".into(),
                timestamp: 1_700_000_004,
            },
            Frame::WebrtcOffer {
                session_id: Some("S2".into()),
                worker_id: Some("w1".into()),
                client_id: Some("c1".into()),
                sdp: "v=0".into(),
            },
        ];

        for frame in &frames {
            assert_eq!(&round_trip(frame), frame, "frame {}", frame.kind());
        }
    }

    #[test]
    fn envelope_shape_matches_wire_contract() {
        let frame = Frame::GetTasks {
            request_id: "R1".into(),
            timestamp: 99,
        };
        let value = serde_json::to_value(&frame).expect("serialize frame");
        assert_eq!(value["type"], "get_tasks");
        assert_eq!(value["payload"]["request_id"], "R1");
        assert_eq!(value["payload"]["timestamp"], 99);
    }

    #[test]
    fn unknown_frame_types_fail_to_parse() {
        let raw = r#"{"type":"shutdown_all","payload":{}}"#;
        assert!(serde_json::from_str::<Frame>(raw).is_err());
    }

    #[test]
    fn offer_omits_absent_routing_fields() {
        let frame = Frame::WebrtcOffer {
            session_id: Some("S1".into()),
            worker_id: None,
            client_id: Some("c1".into()),
            sdp: "v=0".into(),
        };
        let value = serde_json::to_value(&frame).expect("serialize frame");
        assert!(value["payload"].get("worker_id").is_none());
        assert_eq!(value["payload"]["client_id"], "c1");
    }

    #[test]
    fn node_record_round_trips_with_defaults() {
        let raw = r#"{"id":"w1","name":"alpha","address":"10.0.0.2","status":"online"}"#;
        let record: NodeRecord = serde_json::from_str(raw).expect("parse record");
        assert_eq!(record.status, NodeStatus::Online);
        assert!(record.capabilities.is_empty());
        assert!(record.resources.is_empty());

        let echoed = serde_json::to_string(&record).expect("serialize record");
        let parsed: NodeRecord = serde_json::from_str(&echoed).expect("reparse record");
        assert_eq!(parsed, record);
    }
}
