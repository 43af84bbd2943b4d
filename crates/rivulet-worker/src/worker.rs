//! Worker orchestrator: wires the subsystems together and dispatches
//! gateway frames.
//!
//! Every dependency is injected at construction time, so tests can swap the
//! torrent engine and the segmenter without touching the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rivulet_config::WorkerConfig;
use rivulet_data::{TaskRecord, TaskStore};
use rivulet_events::{Event, EventBus, TaskStatus};
use rivulet_proto::{Frame, NodeRecord, NodeStatus, TaskDetail, TaskFileInfo, TaskSummary};
use rivulet_torrent_core::TorrentEngine;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::download::DownloadManager;
use crate::ice::IceConfigProvider;
use crate::link::{self, LinkHandle};
use crate::peer::file_server::FileServer;
use crate::peer::{PeerEvent, PeerManager};
use crate::transcode::TranscodeManager;
use crate::transcode::hls::Segmenter;

/// A fully wired worker node.
pub struct WorkerNode {
    config: WorkerConfig,
    store: TaskStore,
    downloads: DownloadManager,
    peers: Arc<PeerManager>,
    ice: Arc<IceConfigProvider>,
    link: LinkHandle,
    inbound: Option<mpsc::UnboundedReceiver<Frame>>,
    shutdown_tx: watch::Sender<bool>,
    link_task: tokio::task::JoinHandle<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerNode {
    /// Wire up a worker from configuration and the injected engine and
    /// segmenter seams.
    ///
    /// # Errors
    ///
    /// Returns an error when storage directories or the task store cannot
    /// be initialised — fatal startup conditions.
    pub async fn build(
        config: WorkerConfig,
        engine: Arc<dyn TorrentEngine>,
        segmenter: Arc<dyn Segmenter>,
    ) -> anyhow::Result<Self> {
        for dir in config.storage.required_dirs() {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("unable to create storage directory {}", dir.display()))?;
        }

        let store = TaskStore::open(&config.storage.state_path.join("worker.db"))
            .await
            .context("unable to open task store")?;
        let events = EventBus::new();

        let downloads = DownloadManager::new(
            engine,
            store.clone(),
            events.clone(),
            config.node.id.clone(),
            config.limits.max_downloads,
        );

        let transcodes = TranscodeManager::new(
            store.clone(),
            events.clone(),
            segmenter,
            config.storage.download_path.clone(),
            config.storage.playlist_path.clone(),
            config.storage.subtitle_scan_dir.clone(),
            config.limits.max_transcodes,
        );
        let trigger_task = transcodes.spawn_trigger();

        let file_server = Arc::new(FileServer::new(config.storage.playlist_path.clone()));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peers = PeerManager::new(file_server, peer_tx).context("webrtc engine setup failed")?;

        let ice = Arc::new(IceConfigProvider::new(
            &config.gateway.url,
            config.network.stun_servers.clone(),
        ));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (link, link_task) = link::spawn(
            config.gateway.clone(),
            node_record(&config),
            inbound_tx,
            shutdown_rx,
        );

        let mut background = vec![trigger_task];
        background.push(spawn_status_forwarder(events.clone(), link.clone()));
        background.push(spawn_peer_forwarder(peer_rx, link.clone()));

        Ok(Self {
            config,
            store,
            downloads,
            peers,
            ice,
            link,
            inbound: Some(inbound_rx),
            shutdown_tx,
            link_task,
            background,
        })
    }

    /// Run until SIGINT/SIGTERM, then shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error when crash recovery fails at startup.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.downloads
            .recover()
            .await
            .context("crash recovery failed")?;

        let mut inbound = self.inbound.take().context("worker already running")?;
        info!(node_id = %self.config.node.id, "worker running");

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    match frame {
                        Some(frame) => self.handle_frame(frame).await,
                        None => break,
                    }
                }
                () = shutdown_signal() => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!("worker shutting down");
        let _ = self.shutdown_tx.send(true);
        self.downloads.stop().await;
        for task in &self.background {
            task.abort();
        }
        self.peers.close_all().await;
        self.store.close().await;
        self.link_task.abort();
        info!("worker shutdown complete");
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::RegistrationConfirmed { node_id, status } => {
                info!(node_id = %node_id, status = %status, "registration confirmed by gateway");
            }
            Frame::TaskSubmit { magnet_url, .. } => {
                match self.downloads.start_download(&magnet_url).await {
                    Ok(task_id) => {
                        self.link.send(Frame::TaskStatus {
                            task_id,
                            status: TaskStatus::Downloading,
                            progress: 0,
                            timestamp: Utc::now().timestamp(),
                        });
                    }
                    Err(error) => {
                        warn!(error = %error, "task submission rejected");
                    }
                }
            }
            Frame::GetTasks { request_id, .. } => {
                let tasks = match self.store.list_by_worker(&self.config.node.id).await {
                    Ok(records) => records
                        .iter()
                        .map(|record| summary_from_record(record, &self.config.node.id))
                        .collect(),
                    Err(error) => {
                        warn!(error = %error, "task listing failed");
                        Vec::new()
                    }
                };
                self.link.send(Frame::TasksResponse { request_id, tasks });
            }
            Frame::GetTaskDetail { task_id, .. } => {
                let detail = match self.store.get(&task_id).await {
                    Ok(Some(record)) => Some(detail_from_record(&record, &self.config.node.id)),
                    Ok(None) => None,
                    Err(error) => {
                        warn!(task_id = %task_id, error = %error, "task lookup failed");
                        None
                    }
                };
                self.link.send(Frame::TaskDetailResponse {
                    task_id,
                    found: detail.is_some(),
                    task: detail,
                });
            }
            Frame::WebrtcOffer {
                session_id,
                client_id,
                sdp,
                ..
            } => {
                let Some(session_id) = session_id else {
                    warn!("offer without session id dropped");
                    return;
                };
                info!(
                    session_id = %session_id,
                    client_id = client_id.as_deref().unwrap_or("unknown"),
                    "webrtc offer received"
                );

                // The ICE configuration is refreshed before each offer.
                let ice_servers = self.ice.ice_servers().await;
                match self.peers.handle_offer(&session_id, &sdp, ice_servers).await {
                    Ok(answer) => {
                        self.link.send(Frame::WebrtcAnswer {
                            session_id,
                            sdp: answer,
                        });
                    }
                    Err(error) => {
                        warn!(session_id = %session_id, error = %error, "offer handling failed");
                    }
                }
            }
            Frame::IceCandidate {
                session_id,
                candidate,
            } => {
                if let Err(error) = self.peers.add_ice_candidate(&session_id, &candidate).await {
                    warn!(session_id = %session_id, error = %error, "candidate rejected");
                }
            }
            other => {
                warn!(kind = other.kind(), "unexpected frame from gateway");
            }
        }
    }
}

fn node_record(config: &WorkerConfig) -> NodeRecord {
    let mut resources = std::collections::BTreeMap::new();
    resources.insert(
        "max_downloads".to_string(),
        config.limits.max_downloads as i64,
    );
    resources.insert(
        "max_transcodes".to_string(),
        config.limits.max_transcodes as i64,
    );

    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

    NodeRecord {
        id: config.node.id.clone(),
        name: config.node.name.clone(),
        address: config.node.address.clone(),
        status: NodeStatus::Online,
        capabilities: vec![
            "torrent".to_string(),
            "transcode".to_string(),
            "webrtc".to_string(),
        ],
        resources,
        metadata,
    }
}

/// Forward task lifecycle events to the gateway as `task_status` frames.
fn spawn_status_forwarder(events: EventBus, link: LinkHandle) -> tokio::task::JoinHandle<()> {
    let mut stream = events.subscribe(None);
    tokio::spawn(async move {
        let mut last_progress: HashMap<String, u8> = HashMap::new();
        while let Some(envelope) = stream.next().await {
            match envelope.event {
                Event::Progress {
                    task_id, progress, ..
                } => {
                    last_progress.insert(task_id.clone(), progress);
                    link.send(Frame::TaskStatus {
                        task_id,
                        status: TaskStatus::Downloading,
                        progress,
                        timestamp: envelope.timestamp.timestamp(),
                    });
                }
                Event::StatusChanged { task_id, status } => {
                    let progress = match status {
                        TaskStatus::Completed | TaskStatus::Transcoding | TaskStatus::Ready => 100,
                        _ => last_progress.get(&task_id).copied().unwrap_or(0),
                    };
                    link.send(Frame::TaskStatus {
                        task_id,
                        status,
                        progress,
                        timestamp: envelope.timestamp.timestamp(),
                    });
                }
                _ => {}
            }
        }
    })
}

/// Forward locally gathered ICE candidates to the gateway.
fn spawn_peer_forwarder(
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    link: LinkHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = peer_rx.recv().await {
            match event {
                PeerEvent::IceCandidate {
                    session_id,
                    candidate,
                } => {
                    link.send(Frame::IceCandidate {
                        session_id,
                        candidate,
                    });
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Compact wire representation of a task row.
#[must_use]
pub fn summary_from_record(record: &TaskRecord, node_id: &str) -> TaskSummary {
    TaskSummary {
        id: record.task_id.clone(),
        magnet_url: record.magnet_url.clone(),
        status: record.status,
        progress: record.progress,
        speed: record.speed,
        size: record.size,
        downloaded: record.downloaded,
        files: record.files.iter().map(|file| file.name.clone()).collect(),
        torrent_name: record.torrent_name.clone(),
        m3u8_path: record.m3u8_path.clone().unwrap_or_default(),
        srts: record.subtitles.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        worker_id: node_id.to_string(),
    }
}

/// Full wire representation of a task row.
#[must_use]
pub fn detail_from_record(record: &TaskRecord, node_id: &str) -> TaskDetail {
    TaskDetail {
        id: record.task_id.clone(),
        magnet_url: record.magnet_url.clone(),
        status: record.status,
        progress: record.progress,
        speed: record.speed,
        size: record.size,
        downloaded: record.downloaded,
        files: record
            .files
            .iter()
            .map(|file| TaskFileInfo {
                file_name: file.name.clone(),
                file_size: file.size_bytes,
                file_path: file.path.clone(),
                is_selected: file.selected,
            })
            .collect(),
        torrent_name: record.torrent_name.clone(),
        m3u8_path: record.m3u8_path.clone().unwrap_or_default(),
        srts: record.subtitles.clone(),
        segments: record.segments.clone(),
        created_at: record.created_at,
        updated_at: record.updated_at,
        worker_id: node_id.to_string(),
        metadata: record.metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_events::InventoryFile;

    fn record() -> TaskRecord {
        let mut record = TaskRecord::pending(
            "task_1".to_string(),
            "magnet:?xt=urn:btih:AAA".to_string(),
            "w1".to_string(),
        );
        record.status = TaskStatus::Ready;
        record.progress = 100;
        record.speed = 0;
        record.size = 2_048;
        record.downloaded = 2_048;
        record.torrent_name = "movie".to_string();
        record.files = vec![InventoryFile {
            name: "movie.mkv".into(),
            size_bytes: 2_048,
            path: "movie/movie.mkv".into(),
            selected: true,
        }];
        record.m3u8_path = Some("data/m3u8/movie/index.m3u8".to_string());
        record.segments = vec!["data/m3u8/movie/index0.ts".to_string()];
        record.subtitles = vec!["data/m3u8/movie/movie.srt".to_string()];
        record
            .metadata
            .insert("segment_count".into(), serde_json::Value::from(1));
        record
    }

    #[test]
    fn summary_projection_carries_names_and_annotation() {
        let summary = summary_from_record(&record(), "w9");
        assert_eq!(summary.worker_id, "w9");
        assert_eq!(summary.files, vec!["movie.mkv".to_string()]);
        assert_eq!(summary.m3u8_path, "data/m3u8/movie/index.m3u8");
        assert_eq!(summary.status, TaskStatus::Ready);
    }

    #[test]
    fn detail_projection_carries_full_inventory() {
        let detail = detail_from_record(&record(), "w9");
        assert_eq!(detail.files.len(), 1);
        assert_eq!(detail.files[0].file_path, "movie/movie.mkv");
        assert!(detail.files[0].is_selected);
        assert_eq!(detail.segments.len(), 1);
        assert_eq!(detail.metadata["segment_count"], 1);
        assert_eq!(detail.worker_id, "w9");
    }

    #[test]
    fn node_record_advertises_limits_and_capabilities() {
        let mut config = WorkerConfig::default();
        config.node.id = "w1".into();
        let record = node_record(&config);
        assert_eq!(record.id, "w1");
        assert_eq!(record.status, NodeStatus::Online);
        assert!(record.capabilities.contains(&"webrtc".to_string()));
        assert_eq!(record.resources["max_downloads"], 5);
        assert_eq!(record.resources["max_transcodes"], 3);
    }
}
