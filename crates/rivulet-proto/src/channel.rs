//! Peer data-channel file protocol.
//!
//! The browser opens a channel labelled [`CHANNEL_LABEL`] and requests files
//! by logical path; the worker streams them back as base64 chunks in strict
//! ascending `sliceNum` order. The channel itself guarantees ordering, so no
//! reassembly metadata beyond the slice index is needed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Label of the client-created data channel the worker accepts.
pub const CHANNEL_LABEL: &str = "filePathChannel";

/// Fixed chunk size for served files.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Requests arriving on the data channel. Unknown `type` values fail to
/// parse and are dropped by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelRequest {
    /// File fetch keyed by a caller-chosen correlation id.
    #[serde(rename = "hijackReq")]
    File { ts: String, id: String },
}

/// Discriminator for chunk frames: text for playlists and subtitles the
/// browser parses directly, data for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    #[serde(rename = "hijackRespText")]
    Text,
    #[serde(rename = "hijackRespData")]
    Data,
}

impl ChunkKind {
    /// Pick the response kind for a served file name.
    #[must_use]
    pub fn for_file(name: &str) -> Self {
        if name.ends_with(".m3u8") || name.ends_with(".vtt") {
            Self::Text
        } else {
            Self::Data
        }
    }
}

/// One 16 KiB slice of a served file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub id: String,
    pub slice_num: usize,
    pub total_slice_num: usize,
    pub total_length: usize,
    /// Base64 of this slice's bytes.
    pub payload: String,
}

/// Terminal error frame for a failed file request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub error: String,
}

impl ErrorFrame {
    /// Build a `hijackError` frame for the given request.
    #[must_use]
    pub fn new(request_id: &str, error: impl Into<String>) -> Self {
        Self {
            kind: "hijackError".to_string(),
            id: request_id.to_string(),
            error: error.into(),
        }
    }
}

/// Partition `data` into ordered chunk frames for `request_id`.
///
/// Empty files yield a single frame with an empty payload so the client
/// still observes a terminal `sliceNum 0 / totalSliceNum 1` response.
#[must_use]
pub fn chunk_file(request_id: &str, file_name: &str, data: &[u8]) -> Vec<ChunkFrame> {
    let kind = ChunkKind::for_file(file_name);
    let total_length = data.len();
    let total_slice_num = data.len().div_ceil(CHUNK_SIZE).max(1);

    (0..total_slice_num)
        .map(|slice_num| {
            let start = slice_num * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(total_length);
            ChunkFrame {
                kind,
                id: request_id.to_string(),
                slice_num,
                total_slice_num,
                total_length,
                payload: BASE64.encode(&data[start..end]),
            }
        })
        .collect()
}
