//! HLS segmentation primitives: the segmenter subprocess seam, playlist
//! parsing, and the extension tables.
//!
//! The ffmpeg/ffprobe binaries are external collaborators, so everything
//! the manager needs from them sits behind [`Segmenter`]; the production
//! implementation shells out with stream-copy flags (no re-encode).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rivulet_events::InventoryFile;
use tracing::debug;

/// Video suffixes the segmenter accepts.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v",
];

/// External subtitle suffixes picked up from the scan directory.
pub const SUBTITLE_EXTENSIONS: &[&str] = &[".srt", ".vtt", ".ass", ".ssa", ".sub", ".txt"];

/// Errors surfaced by segmentation and probing.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("input file does not exist: {path}")]
    MissingInput { path: PathBuf },
    #[error("filesystem operation failed for {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("segmenter failed: {reason}")]
    Segmenter { reason: String },
    #[error("stream probe failed: {reason}")]
    Probe { reason: String },
    #[error("playlist {path} contains no segments")]
    EmptyPlaylist { path: PathBuf },
}

/// Segmentation parameters.
#[derive(Debug, Clone)]
pub struct HlsSettings {
    /// Segment duration in seconds.
    pub segment_seconds: u32,
    /// Playlist type flag (`vod` keeps every segment listed).
    pub playlist_type: String,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_seconds: 10,
            playlist_type: "vod".to_string(),
        }
    }
}

/// One embedded subtitle stream reported by the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleStream {
    pub index: String,
    pub codec: String,
    pub language: Option<String>,
}

/// Subprocess seam for segmentation, probing, and subtitle conversion.
#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Slice `input` into an HLS playlist at `playlist` (stream copy).
    async fn segment(
        &self,
        input: &Path,
        playlist: &Path,
        settings: &HlsSettings,
    ) -> Result<(), TranscodeError>;

    /// Enumerate embedded subtitle streams of `input`.
    async fn probe_subtitles(&self, input: &Path) -> Result<Vec<SubtitleStream>, TranscodeError>;

    /// Stream-copy one embedded subtitle stream to `output`.
    async fn extract_subtitle(
        &self,
        input: &Path,
        stream_index: &str,
        output: &Path,
    ) -> Result<(), TranscodeError>;

    /// Convert an external subtitle file to `output` (SRT).
    async fn convert_subtitle(&self, input: &Path, output: &Path) -> Result<(), TranscodeError>;
}

/// Production segmenter shelling out to ffmpeg/ffprobe.
pub struct FfmpegSegmenter {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegSegmenter {
    /// Segmenter using binaries resolved through `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl Default for FfmpegSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Segmenter for FfmpegSegmenter {
    async fn segment(
        &self,
        input: &Path,
        playlist: &Path,
        settings: &HlsSettings,
    ) -> Result<(), TranscodeError> {
        let output = tokio::process::Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(input)
            .args(["-c", "copy"])
            .args(["-start_number", "0"])
            .args(["-hls_time", &settings.segment_seconds.to_string()])
            .args(["-hls_list_size", "0"])
            .args(["-hls_playlist_type", &settings.playlist_type])
            .args(["-f", "hls"])
            .arg(playlist)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| TranscodeError::Segmenter {
                reason: format!("failed to launch ffmpeg: {error}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Segmenter {
                reason: format!("ffmpeg exited with {}: {stderr}", output.status),
            });
        }
        Ok(())
    }

    async fn probe_subtitles(&self, input: &Path) -> Result<Vec<SubtitleStream>, TranscodeError> {
        let output = tokio::process::Command::new(&self.ffprobe)
            .args(["-v", "quiet"])
            .args(["-select_streams", "s"])
            .args([
                "-show_entries",
                "stream=index,codec_name:stream_tags=language",
            ])
            .args(["-of", "csv=p=0"])
            .arg(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|error| TranscodeError::Probe {
                reason: format!("failed to launch ffprobe: {error}"),
            })?;

        if !output.status.success() {
            return Err(TranscodeError::Probe {
                reason: format!("ffprobe exited with {}", output.status),
            });
        }
        Ok(parse_probe_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn extract_subtitle(
        &self,
        input: &Path,
        stream_index: &str,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let result = tokio::process::Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(input)
            .args(["-map", &format!("0:{stream_index}")])
            .args(["-c", "copy"])
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|error| TranscodeError::Segmenter {
                reason: format!("failed to launch ffmpeg: {error}"),
            })?;

        if !result.success() {
            return Err(TranscodeError::Segmenter {
                reason: format!("subtitle extraction exited with {result}"),
            });
        }
        Ok(())
    }

    async fn convert_subtitle(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let result = tokio::process::Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(input)
            .arg(output)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|error| TranscodeError::Segmenter {
                reason: format!("failed to launch ffmpeg: {error}"),
            })?;

        if !result.success() {
            return Err(TranscodeError::Segmenter {
                reason: format!("subtitle conversion exited with {result}"),
            });
        }
        Ok(())
    }
}

/// Parse ffprobe's CSV rows (`index,codec[,language]`) into streams.
#[must_use]
pub fn parse_probe_output(raw: &str) -> Vec<SubtitleStream> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.split(',');
            let index = parts.next()?.to_string();
            let codec = parts.next()?.to_string();
            let language = parts.next().map(ToString::to_string).filter(|l| !l.is_empty());
            Some(SubtitleStream {
                index,
                codec,
                language,
            })
        })
        .collect()
}

/// Extract segment file names from a playlist: non-comment lines ending in
/// `.ts`.
#[must_use]
pub fn parse_playlist_segments(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && line.ends_with(".ts"))
        .map(ToString::to_string)
        .collect()
}

/// First video-suffixed file in an inventory, if any.
#[must_use]
pub fn find_video_file(files: &[InventoryFile]) -> Option<&InventoryFile> {
    files.iter().find(|file| {
        let name = file.name.to_lowercase();
        VIDEO_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
    })
}

/// Whether `name` carries one of the external subtitle suffixes.
#[must_use]
pub fn is_subtitle_file(name: &str) -> bool {
    let name = name.to_lowercase();
    SUBTITLE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Whether a playlist exists and already lists segments; lets an
/// interrupted transcode skip re-segmentation on re-trigger.
pub async fn playlist_is_reusable(playlist: &Path) -> bool {
    match tokio::fs::read_to_string(playlist).await {
        Ok(content) => !parse_playlist_segments(&content).is_empty(),
        Err(error) => {
            debug!(playlist = %playlist.display(), error = %error, "playlist not reusable");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_parsing_skips_comments_and_non_segments() {
        let playlist = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXTINF:10.000000,
index0.ts
#EXTINF:10.000000,
index1.ts

subtitle_2.srt
#EXT-X-ENDLIST
";
        assert_eq!(
            parse_playlist_segments(playlist),
            vec!["index0.ts".to_string(), "index1.ts".to_string()]
        );
        assert!(parse_playlist_segments("#EXTM3U\n#EXT-X-ENDLIST\n").is_empty());
    }

    #[test]
    fn probe_output_parsing() {
        let raw = "2,subrip,eng\n3,ass\n\n4,mov_text,\n";
        let streams = parse_probe_output(raw);
        assert_eq!(streams.len(), 3);
        assert_eq!(
            streams[0],
            SubtitleStream {
                index: "2".into(),
                codec: "subrip".into(),
                language: Some("eng".into()),
            }
        );
        assert_eq!(streams[1].language, None);
        assert_eq!(streams[2].language, None);
    }

    #[test]
    fn video_selection_takes_first_match_case_insensitively() {
        let files = vec![
            InventoryFile {
                name: "readme.txt".into(),
                size_bytes: 10,
                path: "t/readme.txt".into(),
                selected: true,
            },
            InventoryFile {
                name: "Movie.MKV".into(),
                size_bytes: 1_000,
                path: "t/Movie.MKV".into(),
                selected: true,
            },
            InventoryFile {
                name: "extra.mp4".into(),
                size_bytes: 500,
                path: "t/extra.mp4".into(),
                selected: true,
            },
        ];
        assert_eq!(find_video_file(&files).expect("match").name, "Movie.MKV");
        assert!(find_video_file(&files[..1]).is_none());
    }

    #[test]
    fn subtitle_suffix_table() {
        assert!(is_subtitle_file("movie.srt"));
        assert!(is_subtitle_file("movie.VTT"));
        assert!(is_subtitle_file("movie.ass"));
        assert!(!is_subtitle_file("movie.ts"));
        assert!(!is_subtitle_file("movie.mkv"));
    }

    #[tokio::test]
    async fn playlist_reuse_requires_parseable_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let playlist = dir.path().join("index.m3u8");

        assert!(!playlist_is_reusable(&playlist).await, "missing file");

        tokio::fs::write(&playlist, "#EXTM3U\n#EXT-X-ENDLIST\n")
            .await
            .expect("write");
        assert!(!playlist_is_reusable(&playlist).await, "no segments");

        tokio::fs::write(&playlist, "#EXTM3U\n#EXTINF:10.0,\nindex0.ts\n#EXT-X-ENDLIST\n")
            .await
            .expect("write");
        assert!(playlist_is_reusable(&playlist).await);
    }
}
