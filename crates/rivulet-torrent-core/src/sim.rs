//! Deterministic simulated torrent engine.
//!
//! Used by the pipeline tests and by engine-less builds of the worker
//! binary: downloads accrue bytes either on a wall-clock rate or under
//! manual test control, and metadata resolution honours a configurable
//! delay so deadline paths stay testable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rivulet_events::InventoryFile;
use tokio::sync::Mutex;

use crate::{TorrentEngine, TorrentHandle, TorrentMetadata, magnet_display_name};

/// Behaviour profile for simulated torrents.
#[derive(Debug, Clone)]
pub struct SimProfile {
    /// Total payload size reported by metadata.
    pub total_bytes: u64,
    /// Bytes accrued per second once started; zero means bytes only move
    /// under [`SimHandle::advance`].
    pub rate_bps: u64,
    /// Delay before metadata resolves.
    pub metadata_delay: Duration,
    /// File inventory override; a single `<name>.mp4` file when empty.
    pub files: Vec<InventoryFile>,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            total_bytes: 64 * 1024 * 1024,
            rate_bps: 8 * 1024 * 1024,
            metadata_delay: Duration::from_millis(50),
            files: Vec::new(),
        }
    }
}

/// Simulated engine handing out [`SimHandle`]s keyed by magnet URI.
pub struct SimTorrentEngine {
    profile: SimProfile,
    handles: Mutex<HashMap<String, Arc<SimHandle>>>,
    /// Magnets containing this needle are refused at admission, for
    /// error-path tests.
    refuse_needle: Option<String>,
}

impl SimTorrentEngine {
    /// Engine with the given profile.
    #[must_use]
    pub fn new(profile: SimProfile) -> Self {
        Self {
            profile,
            handles: Mutex::new(HashMap::new()),
            refuse_needle: None,
        }
    }

    /// Engine that refuses any magnet containing `needle`.
    #[must_use]
    pub fn refusing(profile: SimProfile, needle: impl Into<String>) -> Self {
        Self {
            refuse_needle: Some(needle.into()),
            ..Self::new(profile)
        }
    }

    /// Concrete handle for a previously admitted magnet, for test steering.
    pub async fn handle_for(&self, uri: &str) -> Option<Arc<SimHandle>> {
        self.handles.lock().await.get(uri).cloned()
    }
}

impl Default for SimTorrentEngine {
    fn default() -> Self {
        Self::new(SimProfile::default())
    }
}

#[async_trait]
impl TorrentEngine for SimTorrentEngine {
    async fn add_magnet(
        &self,
        uri: &str,
        _trackers: &[&str],
    ) -> anyhow::Result<Arc<dyn TorrentHandle>> {
        if let Some(needle) = &self.refuse_needle {
            if uri.contains(needle.as_str()) {
                anyhow::bail!("engine refused magnet");
            }
        }

        let handle = Arc::new(SimHandle::new(uri, &self.profile));
        self.handles
            .lock()
            .await
            .insert(uri.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

/// Simulated live torrent.
pub struct SimHandle {
    metadata: TorrentMetadata,
    metadata_delay: Duration,
    rate_bps: u64,
    manual_bytes: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl SimHandle {
    fn new(uri: &str, profile: &SimProfile) -> Self {
        let name = magnet_display_name(uri).unwrap_or_else(|| {
            let hash = uri
                .split("btih:")
                .nth(1)
                .map_or("unknown", |rest| &rest[..rest.len().min(8)]);
            format!("torrent-{hash}")
        });
        let files = if profile.files.is_empty() {
            vec![InventoryFile {
                name: format!("{name}.mp4"),
                size_bytes: profile.total_bytes,
                path: format!("{name}/{name}.mp4"),
                selected: true,
            }]
        } else {
            profile.files.clone()
        };

        Self {
            metadata: TorrentMetadata {
                name,
                total_bytes: profile.total_bytes,
                files,
            },
            metadata_delay: profile.metadata_delay,
            rate_bps: profile.rate_bps,
            manual_bytes: AtomicU64::new(0),
            started_at: Mutex::new(None),
        }
    }

    /// Push the byte counter forward by `bytes`, saturating at the total.
    pub fn advance(&self, bytes: u64) {
        self.manual_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Jump straight to completion.
    pub fn finish(&self) {
        self.manual_bytes
            .store(self.metadata.total_bytes, Ordering::Relaxed);
    }
}

#[async_trait]
impl TorrentHandle for SimHandle {
    async fn metadata(&self) -> anyhow::Result<TorrentMetadata> {
        tokio::time::sleep(self.metadata_delay).await;
        Ok(self.metadata.clone())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut started = self.started_at.lock().await;
        if started.is_none() {
            *started = Some(Instant::now());
        }
        Ok(())
    }

    async fn bytes_completed(&self) -> u64 {
        let manual = self.manual_bytes.load(Ordering::Relaxed);
        let accrued = match (*self.started_at.lock().await, self.rate_bps) {
            (Some(started), rate) if rate > 0 => {
                (started.elapsed().as_secs_f64() * rate as f64) as u64
            }
            _ => 0,
        };
        (manual + accrued).min(self.metadata.total_bytes)
    }

    async fn shutdown(&self) {
        *self.started_at.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef&dn=fixture";

    fn manual_profile(total: u64) -> SimProfile {
        SimProfile {
            total_bytes: total,
            rate_bps: 0,
            metadata_delay: Duration::from_millis(1),
            files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn metadata_reports_profile_shape() {
        let engine = SimTorrentEngine::new(manual_profile(1_000));
        let handle = engine
            .add_magnet(MAGNET, DEFAULT_TRACKERS)
            .await
            .expect("admit");
        let metadata = handle.metadata().await.expect("metadata");
        assert_eq!(metadata.name, "fixture");
        assert_eq!(metadata.total_bytes, 1_000);
        assert_eq!(metadata.files.len(), 1);
        assert!(metadata.files[0].selected);
    }

    const DEFAULT_TRACKERS: &[&str] = crate::DEFAULT_PUBLIC_TRACKERS;

    #[tokio::test]
    async fn manual_advance_saturates_at_total() {
        let engine = SimTorrentEngine::new(manual_profile(500));
        let _ = engine
            .add_magnet(MAGNET, DEFAULT_TRACKERS)
            .await
            .expect("admit");
        let handle = engine.handle_for(MAGNET).await.expect("handle");

        handle.start().await.expect("start");
        assert_eq!(handle.bytes_completed().await, 0);

        handle.advance(300);
        assert_eq!(handle.bytes_completed().await, 300);

        handle.advance(10_000);
        assert_eq!(handle.bytes_completed().await, 500);
    }

    #[tokio::test]
    async fn refusal_is_scoped_to_matching_magnets() {
        let engine = SimTorrentEngine::refusing(manual_profile(10), "deadbeef");
        assert!(
            engine
                .add_magnet("magnet:?xt=urn:btih:deadbeef", DEFAULT_TRACKERS)
                .await
                .is_err()
        );
        assert!(engine.add_magnet(MAGNET, DEFAULT_TRACKERS).await.is_ok());
    }
}
