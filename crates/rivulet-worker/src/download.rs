//! Download manager: admission, the per-task download loop, and crash
//! recovery.
//!
//! Every task gets one tokio task that walks the status machine
//! `pending → downloading → completed` and is the sole writer of its row
//! while downloading. External pause/remove is cooperative: each progress
//! tick re-reads the persisted status and exits cleanly when it is no
//! longer `downloading`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rivulet_data::{DataError, TaskRecord, TaskStore};
use rivulet_events::{Event, EventBus, TaskStatus};
use rivulet_torrent_core::{DEFAULT_PUBLIC_TRACKERS, TorrentEngine, TorrentHandle};
use tracing::{info, warn};
use uuid::Uuid;

/// Deadline for magnet metadata acquisition.
pub const METADATA_DEADLINE: Duration = Duration::from_secs(2 * 60);

/// Interval between progress samples.
pub const PROGRESS_TICK: Duration = Duration::from_secs(2);

/// Errors surfaced by download admission and control.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The per-worker concurrency cap is reached; no task record is created.
    #[error("maximum active downloads reached ({limit})")]
    LimitReached { limit: usize },
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },
    #[error(transparent)]
    Store(#[from] DataError),
}

/// Download manager over an engine, a store, and the worker event bus.
#[derive(Clone)]
pub struct DownloadManager {
    engine: Arc<dyn TorrentEngine>,
    store: TaskStore,
    events: EventBus,
    worker_id: String,
    max_downloads: usize,
    active: Arc<Mutex<HashMap<String, Arc<dyn TorrentHandle>>>>,
}

impl DownloadManager {
    /// Build a manager.
    #[must_use]
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        store: TaskStore,
        events: EventBus,
        worker_id: String,
        max_downloads: usize,
    ) -> Self {
        Self {
            engine,
            store,
            events,
            worker_id,
            max_downloads,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admit a magnet and start its download asynchronously.
    ///
    /// Returns the freshly allocated task id immediately; the torrent work
    /// proceeds in its own task.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::LimitReached`] at the concurrency cap (no
    /// record is created) or a store error when persistence fails.
    pub async fn start_download(&self, magnet_url: &str) -> Result<String, DownloadError> {
        let active = self.store.active_count(&self.worker_id).await?;
        if active >= self.max_downloads as u64 {
            return Err(DownloadError::LimitReached {
                limit: self.max_downloads,
            });
        }

        let task_id = format!("task_{}", Uuid::new_v4().simple());
        let record = TaskRecord::pending(
            task_id.clone(),
            magnet_url.to_string(),
            self.worker_id.clone(),
        );
        self.store.create(&record).await?;
        self.events.publish(Event::TaskQueued {
            task_id: task_id.clone(),
            magnet_uri: magnet_url.to_string(),
        });

        info!(task_id = %task_id, "download task admitted");
        self.spawn_task(task_id.clone(), magnet_url.to_string());
        Ok(task_id)
    }

    /// Drop the live handle and persist `paused`. The loop observes the
    /// status flip on its next tick and exits.
    ///
    /// # Errors
    ///
    /// Returns a store error when the status update fails.
    pub async fn pause_task(&self, task_id: &str) -> Result<(), DownloadError> {
        self.drop_handle(task_id).await;
        self.store.update_status(task_id, TaskStatus::Paused).await?;
        self.events.publish(Event::StatusChanged {
            task_id: task_id.to_string(),
            status: TaskStatus::Paused,
        });
        Ok(())
    }

    /// Re-enter the work unit for a paused task. Metadata re-acquisition is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::TaskNotFound`] for unknown ids.
    pub async fn resume_task(&self, task_id: &str) -> Result<(), DownloadError> {
        let record =
            self.store
                .get(task_id)
                .await?
                .ok_or_else(|| DownloadError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;
        if record.status == TaskStatus::Paused {
            self.spawn_task(record.task_id, record.magnet_url);
        }
        Ok(())
    }

    /// Drop the live handle and delete the task record.
    ///
    /// # Errors
    ///
    /// Returns a store error when the delete fails.
    pub async fn remove_task(&self, task_id: &str) -> Result<(), DownloadError> {
        self.drop_handle(task_id).await;
        self.store.delete(task_id).await?;
        Ok(())
    }

    /// Reschedule every task persisted as `downloading` and reset
    /// `transcoding` tasks to `completed` so the transcode trigger re-fires.
    ///
    /// # Errors
    ///
    /// Returns a store error when the listings fail.
    pub async fn recover(&self) -> Result<(), DownloadError> {
        for record in self.store.list_by_status(TaskStatus::Downloading).await? {
            info!(task_id = %record.task_id, "rescheduling interrupted download");
            self.spawn_task(record.task_id, record.magnet_url);
        }

        for record in self.store.list_by_status(TaskStatus::Transcoding).await? {
            info!(task_id = %record.task_id, "re-arming interrupted transcode");
            self.store
                .update_status(&record.task_id, TaskStatus::Completed)
                .await?;
            self.events.publish(Event::StatusChanged {
                task_id: record.task_id,
                status: TaskStatus::Completed,
            });
        }
        Ok(())
    }

    /// Shut down every live handle, leaving task rows untouched.
    pub async fn stop(&self) {
        let handles: Vec<Arc<dyn TorrentHandle>> = {
            let mut active = self.active.lock().expect("active map lock poisoned");
            active.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }

    fn spawn_task(&self, task_id: String, magnet_url: String) {
        let manager = self.clone();
        let worker = tokio::spawn({
            let task_id = task_id.clone();
            async move { manager.run_task(&task_id, &magnet_url).await }
        });

        // Last-resort funnel: failures and panics both land in the task row
        // and on the bus, never across the task boundary.
        let manager = self.clone();
        tokio::spawn(async move {
            let failure = match worker.await {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(join_error) if join_error.is_panic() => Some(format!("panic: {join_error}")),
                Err(_) => None,
            };
            if let Some(message) = failure {
                manager.record_failure(&task_id, &message).await;
            }
        });
    }

    async fn record_failure(&self, task_id: &str, message: &str) {
        warn!(task_id = %task_id, error = %message, "download task failed");
        self.drop_handle(task_id).await;
        if let Err(store_error) = self.store.set_error(task_id, message).await {
            warn!(task_id = %task_id, error = %store_error, "failed to persist task error");
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

    async fn drop_handle(&self, task_id: &str) {
        let handle = {
            let mut active = self.active.lock().expect("active map lock poisoned");
            active.remove(task_id)
        };
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    async fn run_task(&self, task_id: &str, magnet_url: &str) -> Result<(), String> {
        let handle = self
            .engine
            .add_magnet(magnet_url, DEFAULT_PUBLIC_TRACKERS)
            .await
            .map_err(|error| format!("engine rejected magnet: {error}"))?;
        {
            let mut active = self.active.lock().expect("active map lock poisoned");
            active.insert(task_id.to_string(), Arc::clone(&handle));
        }

        let metadata = match tokio::time::timeout(METADATA_DEADLINE, handle.metadata()).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(error)) => return Err(format!("metadata acquisition failed: {error}")),
            Err(_) => return Err("metadata deadline elapsed".to_string()),
        };

        self.store
            .set_inventory(task_id, &metadata.name, metadata.total_bytes, &metadata.files)
            .await
            .map_err(|error| error.to_string())?;
        self.events.publish(Event::MetadataResolved {
            task_id: task_id.to_string(),
            name: metadata.name.clone(),
            total_bytes: metadata.total_bytes,
            files: metadata.files.clone(),
        });
        info!(
            task_id = %task_id,
            torrent = %metadata.name,
            size = metadata.total_bytes,
            "torrent metadata resolved"
        );

        self.store
            .update_status(task_id, TaskStatus::Downloading)
            .await
            .map_err(|error| error.to_string())?;
        self.events.publish(Event::StatusChanged {
            task_id: task_id.to_string(),
            status: TaskStatus::Downloading,
        });

        handle
            .start()
            .await
            .map_err(|error| format!("fetch start failed: {error}"))?;

        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut previous_bytes: u64 = 0;
        let mut previous_at = Instant::now();

        loop {
            ticker.tick().await;

            // External pause/remove flips the persisted status; exit cleanly.
            let current = self
                .store
                .get(task_id)
                .await
                .map_err(|error| error.to_string())?;
            let Some(current) = current else {
                self.drop_handle(task_id).await;
                return Ok(());
            };
            if current.status != TaskStatus::Downloading {
                self.drop_handle(task_id).await;
                return Ok(());
            }

            let downloaded = handle.bytes_completed().await;
            let progress = if metadata.total_bytes > 0 {
                ((downloaded.saturating_mul(100)) / metadata.total_bytes).min(100) as u8
            } else {
                0
            };

            let now = Instant::now();
            let elapsed = now.duration_since(previous_at).as_secs_f64();
            let speed = if elapsed > 0.0 {
                (downloaded.saturating_sub(previous_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            previous_bytes = downloaded;
            previous_at = now;

            self.store
                .update_progress(task_id, progress, speed, downloaded)
                .await
                .map_err(|error| error.to_string())?;
            self.events.publish(Event::Progress {
                task_id: task_id.to_string(),
                progress,
                speed_bps: speed,
                bytes_downloaded: downloaded,
            });

            if progress >= 100 {
                self.store
                    .update_status(task_id, TaskStatus::Completed)
                    .await
                    .map_err(|error| error.to_string())?;
                self.drop_handle(task_id).await;
                self.events.publish(Event::StatusChanged {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Completed,
                });
                info!(task_id = %task_id, "download completed");
                return Ok(());
            }
        }
    }
}
