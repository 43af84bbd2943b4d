//! Transcode manager: drives `completed → transcoding → ready`.
//!
//! A bus subscription observes download completions; each accepted task
//! runs one job under a `max_transcodes` semaphore. Jobs are idempotent on
//! re-trigger: an existing, parseable playlist skips re-segmentation and
//! goes straight to inventory collection.

pub mod hls;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rivulet_data::TaskStore;
use rivulet_events::{Event, EventBus, TaskStatus};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use hls::{
    HlsSettings, Segmenter, TranscodeError, find_video_file, is_subtitle_file,
    parse_playlist_segments, playlist_is_reusable,
};

/// Lifecycle of a transcode job. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One transcode job, bound to a task for its lifetime.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub job_id: String,
    pub task_id: String,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub status: JobStatus,
    pub playlist_path: Option<PathBuf>,
    pub subtitles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

struct JobOutcome {
    playlist: PathBuf,
    segments: Vec<String>,
    subtitles: Vec<String>,
}

/// Manager owning the segmenter seam and the job table.
pub struct TranscodeManager {
    store: TaskStore,
    events: EventBus,
    segmenter: Arc<dyn Segmenter>,
    download_root: PathBuf,
    playlist_root: PathBuf,
    subtitle_scan_dir: Option<PathBuf>,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, TranscodeJob>>,
}

impl TranscodeManager {
    /// Build a manager.
    #[must_use]
    pub fn new(
        store: TaskStore,
        events: EventBus,
        segmenter: Arc<dyn Segmenter>,
        download_root: PathBuf,
        playlist_root: PathBuf,
        subtitle_scan_dir: Option<PathBuf>,
        max_transcodes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            segmenter,
            download_root,
            playlist_root,
            subtitle_scan_dir,
            permits: Arc::new(Semaphore::new(max_transcodes.max(1))),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to the bus and transcode every task that reaches
    /// `completed`.
    pub fn spawn_trigger(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut stream = manager.events.subscribe(None);
        tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                if let Event::StatusChanged {
                    task_id,
                    status: TaskStatus::Completed,
                } = envelope.event
                {
                    manager.spawn_job(task_id);
                }
            }
        })
    }

    /// Snapshot of the job table.
    #[must_use]
    pub fn jobs(&self) -> Vec<TranscodeJob> {
        let jobs = self.jobs.lock().expect("job table lock poisoned");
        let mut all: Vec<TranscodeJob> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    fn spawn_job(self: &Arc<Self>, task_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(message) = manager.process_completed(&task_id).await {
                manager.fail_task(&task_id, &message).await;
            }
        });
    }

    /// Run the transcode pipeline for a task that reached `completed`.
    /// Stale triggers (status moved on since) are ignored.
    ///
    /// # Errors
    ///
    /// Returns a message describing the failure; the caller funnels it into
    /// the task row.
    pub async fn process_completed(&self, task_id: &str) -> Result<(), String> {
        let record = self
            .store
            .get(task_id)
            .await
            .map_err(|error| error.to_string())?;
        let Some(record) = record else {
            return Ok(());
        };
        if record.status != TaskStatus::Completed {
            return Ok(());
        }

        let Some(video) = find_video_file(&record.files).cloned() else {
            info!(task_id = %task_id, "no video file in inventory; task is ready as-is");
            self.store
                .update_status(task_id, TaskStatus::Ready)
                .await
                .map_err(|error| error.to_string())?;
            self.events.publish(Event::StatusChanged {
                task_id: task_id.to_string(),
                status: TaskStatus::Ready,
            });
            return Ok(());
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| "transcode manager is shut down".to_string())?;

        let input = self.download_root.join(&video.path);
        let job_id = format!("job_{}", Uuid::new_v4().simple());
        self.track_job(&job_id, task_id, &input);

        self.store
            .update_status(task_id, TaskStatus::Transcoding)
            .await
            .map_err(|error| error.to_string())?;
        self.set_job_status(&job_id, JobStatus::Processing);
        self.events.publish(Event::StatusChanged {
            task_id: task_id.to_string(),
            status: TaskStatus::Transcoding,
        });
        self.events.publish(Event::TranscodeStarted {
            task_id: task_id.to_string(),
            input: input.display().to_string(),
        });

        match self.run_job(&input).await {
            Ok(outcome) => {
                let mut metadata = record.metadata.clone();
                metadata.insert(
                    "output_path".to_string(),
                    serde_json::Value::from(
                        outcome
                            .playlist
                            .parent()
                            .unwrap_or(Path::new(""))
                            .display()
                            .to_string(),
                    ),
                );
                metadata.insert(
                    "segment_count".to_string(),
                    serde_json::Value::from(outcome.segments.len()),
                );

                let playlist = outcome.playlist.display().to_string();
                self.store
                    .set_transcode_artifacts(
                        task_id,
                        &playlist,
                        &outcome.segments,
                        &outcome.subtitles,
                        &metadata,
                    )
                    .await
                    .map_err(|error| error.to_string())?;
                self.store
                    .update_status(task_id, TaskStatus::Ready)
                    .await
                    .map_err(|error| error.to_string())?;

                self.finish_job(&job_id, &outcome);
                self.events.publish(Event::StatusChanged {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Ready,
                });
                self.events.publish(Event::TranscodeFinished {
                    task_id: task_id.to_string(),
                    playlist,
                    segment_count: outcome.segments.len(),
                    subtitle_count: outcome.subtitles.len(),
                });
                info!(task_id = %task_id, "transcode completed");
                Ok(())
            }
            Err(error) => {
                self.set_job_status(&job_id, JobStatus::Error);
                Err(error.to_string())
            }
        }
    }

    async fn run_job(&self, input: &Path) -> Result<JobOutcome, TranscodeError> {
        if !input.exists() {
            return Err(TranscodeError::MissingInput {
                path: input.to_path_buf(),
            });
        }

        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());
        let out_dir = self.playlist_root.join(&stem);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                path: out_dir.clone(),
                source,
            })?;

        let playlist = out_dir.join("index.m3u8");
        if playlist_is_reusable(&playlist).await {
            info!(playlist = %playlist.display(), "reusing existing playlist");
        } else {
            let is_mkv = input
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mkv"));
            if is_mkv {
                self.extract_embedded_subtitles(input, &out_dir).await;
            }
            self.segmenter
                .segment(input, &playlist, &HlsSettings::default())
                .await?;
        }

        let scan_dir = self
            .subtitle_scan_dir
            .clone()
            .or_else(|| input.parent().map(Path::to_path_buf));
        if let Some(scan_dir) = scan_dir {
            self.collect_external_subtitles(&scan_dir, &out_dir).await;
        }

        let content =
            tokio::fs::read_to_string(&playlist)
                .await
                .map_err(|source| TranscodeError::Io {
                    path: playlist.clone(),
                    source,
                })?;
        let names = parse_playlist_segments(&content);
        if names.is_empty() {
            return Err(TranscodeError::EmptyPlaylist { path: playlist });
        }
        let segments: Vec<String> = names
            .iter()
            .map(|name| out_dir.join(name).display().to_string())
            .collect();

        let subtitles = self.subtitle_inventory(&out_dir).await;
        Ok(JobOutcome {
            playlist,
            segments,
            subtitles,
        })
    }

    /// Probe and stream-copy embedded subtitle streams. Failures are logged
    /// and never abort the job.
    async fn extract_embedded_subtitles(&self, input: &Path, out_dir: &Path) {
        let streams = match self.segmenter.probe_subtitles(input).await {
            Ok(streams) => streams,
            Err(error) => {
                warn!(input = %input.display(), error = %error, "subtitle probe failed");
                return;
            }
        };
        for stream in streams {
            let output = out_dir.join(format!("subtitle_{}.{}", stream.index, stream.codec));
            if let Err(error) = self
                .segmenter
                .extract_subtitle(input, &stream.index, &output)
                .await
            {
                warn!(
                    input = %input.display(),
                    stream = %stream.index,
                    error = %error,
                    "subtitle extraction failed"
                );
            }
        }
    }

    /// Walk the scan directory for external subtitle files: `.srt` copies
    /// verbatim, everything else converts through the segmenter. Failures
    /// are logged and never abort the job.
    async fn collect_external_subtitles(&self, scan_dir: &Path, out_dir: &Path) {
        let mut pending = vec![scan_dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
                else {
                    continue;
                };
                if !is_subtitle_file(&name) {
                    continue;
                }

                let stem = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "subtitle".to_string());
                let target = out_dir.join(format!("{stem}.srt"));
                let result = if name.to_lowercase().ends_with(".srt") {
                    tokio::fs::copy(&path, &target)
                        .await
                        .map(|_| ())
                        .map_err(|source| TranscodeError::Io {
                            path: path.clone(),
                            source,
                        })
                } else {
                    self.segmenter.convert_subtitle(&path, &target).await
                };
                if let Err(error) = result {
                    warn!(path = %path.display(), error = %error, "external subtitle ingestion failed");
                }
            }
        }
    }

    async fn subtitle_inventory(&self, out_dir: &Path) -> Vec<String> {
        let mut subtitles = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(out_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_subtitle = path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("srt") || ext.eq_ignore_ascii_case("vtt"));
                if is_subtitle {
                    subtitles.push(path.display().to_string());
                }
            }
        }
        subtitles.sort();
        subtitles
    }

    async fn fail_task(&self, task_id: &str, message: &str) {
        warn!(task_id = %task_id, error = %message, "transcode failed");
        if let Err(store_error) = self.store.set_error(task_id, message).await {
            warn!(task_id = %task_id, error = %store_error, "failed to persist transcode error");
        }
        self.events.publish(Event::StatusChanged {
            task_id: task_id.to_string(),
            status: TaskStatus::Error,
        });
        self.events.publish(Event::TaskFailed {
            task_id: task_id.to_string(),
            message: message.to_string(),
        });
    }

    fn track_job(&self, job_id: &str, task_id: &str, input: &Path) {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        jobs.insert(
            job_id.to_string(),
            TranscodeJob {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
                input_path: input.to_path_buf(),
                output_dir: self.playlist_root.join(stem),
                status: JobStatus::Pending,
                playlist_path: None,
                subtitles: Vec::new(),
                created_at: Utc::now(),
            },
        );
    }

    fn set_job_status(&self, job_id: &str, status: JobStatus) {
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        if let Some(job) = jobs.get_mut(job_id) {
            if !job.status.is_terminal() {
                job.status = status;
            }
        }
    }

    fn finish_job(&self, job_id: &str, outcome: &JobOutcome) {
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        if let Some(job) = jobs.get_mut(job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Completed;
                job.playlist_path = Some(outcome.playlist.clone());
                job.subtitles = outcome.subtitles.clone();
            }
        }
    }
}
