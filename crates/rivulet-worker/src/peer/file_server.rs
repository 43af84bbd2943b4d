//! Data-channel file server.
//!
//! Requests name a `<task_directory>/<filename>` pair, possibly wrapped in
//! an absolute URL and a `video/` route prefix. Traversal attempts are
//! dropped without a reply; misses get a `hijackError`; hits stream back as
//! ordered 16 KiB base64 chunks.

use std::path::PathBuf;

use rivulet_proto::channel::{ChannelRequest, ErrorFrame, chunk_file};
use tracing::{debug, warn};

/// Parsed routing outcome for a requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPath {
    /// Traversal attempt; reply with nothing.
    Rejected,
    /// Structurally unusable path; reply with a quiet error frame.
    Invalid,
    /// `<task_directory>/<filename>` pair.
    File { task_dir: String, file_name: String },
}

/// Extract the logical file path from a request's `ts` field.
#[must_use]
pub fn extract_request_path(ts: &str) -> RequestPath {
    if ts.contains("../") || ts.contains("..\\") {
        return RequestPath::Rejected;
    }

    // Absolute URLs lose scheme and host; only the path matters.
    let mut path = ts;
    if let Some(scheme_end) = path.find("://") {
        let rest = &path[scheme_end + 3..];
        path = rest.find('/').map_or("", |slash| &rest[slash..]);
    }
    let path = path.trim_start_matches('/');
    let path = path.strip_prefix("video/").unwrap_or(path);

    let mut parts = path.split('/').filter(|part| !part.is_empty());
    match (parts.next(), parts.next()) {
        (Some(task_dir), Some(file_name)) => RequestPath::File {
            task_dir: task_dir.to_string(),
            file_name: file_name.to_string(),
        },
        _ => RequestPath::Invalid,
    }
}

/// Result of serving one data-channel message.
#[derive(Debug, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Send nothing.
    Silent,
    /// Send these JSON frames, in order.
    Frames(Vec<String>),
}

/// Serves playlist/segment/subtitle files from the playlist root.
pub struct FileServer {
    playlist_root: PathBuf,
}

impl FileServer {
    /// Server rooted at the worker's playlist directory.
    #[must_use]
    pub fn new(playlist_root: PathBuf) -> Self {
        Self { playlist_root }
    }

    /// Handle one raw data-channel message and produce the frames to send.
    pub async fn respond(&self, payload: &[u8]) -> ServeOutcome {
        let request: ChannelRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(error) => {
                debug!(error = %error, "unparseable data-channel message dropped");
                return ServeOutcome::Silent;
            }
        };
        let ChannelRequest::File { ts, id } = request;

        let (task_dir, file_name) = match extract_request_path(&ts) {
            RequestPath::Rejected => {
                debug!(ts = %ts, "traversal attempt dropped");
                return ServeOutcome::Silent;
            }
            RequestPath::Invalid => {
                debug!(ts = %ts, "invalid file path in request");
                return error_frames(&id, "Invalid file path");
            }
            RequestPath::File {
                task_dir,
                file_name,
            } => (task_dir, file_name),
        };

        let Some(path) = self.locate(&task_dir, &file_name).await else {
            debug!(task_dir = %task_dir, file_name = %file_name, "requested file not found");
            return error_frames(&id, "File not found");
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to read served file");
                return error_frames(&id, "Failed to read file");
            }
        };

        let frames = chunk_file(&id, &file_name, &data)
            .iter()
            .filter_map(|frame| serde_json::to_string(frame).ok())
            .collect();
        ServeOutcome::Frames(frames)
    }

    /// Resolve a file under the advertised task directory, falling back to
    /// the first sibling directory containing it: the directory may have
    /// been named by the video stem rather than the task id.
    async fn locate(&self, task_dir: &str, file_name: &str) -> Option<PathBuf> {
        let direct = self.playlist_root.join(task_dir).join(file_name);
        if tokio::fs::try_exists(&direct).await.unwrap_or(false) {
            return Some(direct);
        }

        let mut entries = tokio::fs::read_dir(&self.playlist_root).await.ok()?;
        let mut siblings = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                siblings.push(path);
            }
        }
        siblings.sort();

        for sibling in siblings {
            let candidate = sibling.join(file_name);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                debug!(candidate = %candidate.display(), "served via sibling directory fallback");
                return Some(candidate);
            }
        }
        None
    }
}

fn error_frames(request_id: &str, message: &str) -> ServeOutcome {
    match serde_json::to_string(&ErrorFrame::new(request_id, message)) {
        Ok(frame) => ServeOutcome::Frames(vec![frame]),
        Err(_) => ServeOutcome::Silent,
    }
}
