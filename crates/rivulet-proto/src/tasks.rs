//! Task DTOs carried inside `tasks_response` and `task_detail_response`
//! frames. Field names follow the wire contract of the original services;
//! the `worker_id` annotation lets the gateway merge per-worker lists
//! without deduplication.

use chrono::{DateTime, Utc};
use rivulet_events::TaskStatus;
use serde::{Deserialize, Serialize};

/// One file inside a torrent, as reported in task detail responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFileInfo {
    pub file_name: String,
    pub file_size: u64,
    pub file_path: String,
    pub is_selected: bool,
}

/// Compact task representation used by list responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub magnet_url: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: u64,
    pub size: u64,
    pub downloaded: u64,
    /// Display names only; the full inventory travels in detail responses.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub torrent_name: String,
    #[serde(default)]
    pub m3u8_path: String,
    #[serde(default)]
    pub srts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Responding worker, annotated so merged lists stay attributable.
    #[serde(default)]
    pub worker_id: String,
}

/// Full task representation used by detail responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub id: String,
    pub magnet_url: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub speed: u64,
    pub size: u64,
    pub downloaded: u64,
    #[serde(default)]
    pub files: Vec<TaskFileInfo>,
    #[serde(default)]
    pub torrent_name: String,
    #[serde(default)]
    pub m3u8_path: String,
    #[serde(default)]
    pub srts: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}
