//! End-to-end task pipeline: a submitted magnet walks
//! `pending → downloading → completed → transcoding → ready`, leaving a
//! playlist and segment inventory behind.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rivulet_data::TaskStore;
use rivulet_events::{Event, EventBus, TaskStatus};
use rivulet_torrent_core::sim::{SimProfile, SimTorrentEngine};
use rivulet_worker::download::DownloadManager;
use rivulet_worker::transcode::TranscodeManager;
use rivulet_worker::transcode::hls::{HlsSettings, Segmenter, SubtitleStream, TranscodeError};
use tokio::time::timeout;

const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef&dn=pipeline-movie";

/// Writes a believable playlist plus segments instead of shelling out.
struct PlaylistWritingSegmenter;

#[async_trait]
impl Segmenter for PlaylistWritingSegmenter {
    async fn segment(
        &self,
        _input: &Path,
        playlist: &Path,
        _settings: &HlsSettings,
    ) -> Result<(), TranscodeError> {
        let dir = playlist.parent().expect("playlist parent");
        let mut content = String::from("#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n");
        for i in 0..3 {
            content.push_str(&format!("#EXTINF:10.000000,\nindex{i}.ts\n"));
            tokio::fs::write(dir.join(format!("index{i}.ts")), vec![i as u8; 1_024])
                .await
                .expect("write segment");
        }
        content.push_str("#EXT-X-ENDLIST\n");
        tokio::fs::write(playlist, content).await.expect("write playlist");
        Ok(())
    }

    async fn probe_subtitles(&self, _input: &Path) -> Result<Vec<SubtitleStream>, TranscodeError> {
        Ok(Vec::new())
    }

    async fn extract_subtitle(
        &self,
        _input: &Path,
        _stream_index: &str,
        _output: &Path,
    ) -> Result<(), TranscodeError> {
        Ok(())
    }

    async fn convert_subtitle(
        &self,
        _input: &Path,
        _output: &Path,
    ) -> Result<(), TranscodeError> {
        Ok(())
    }
}

#[tokio::test]
async fn magnet_submission_reaches_ready_with_playlist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let download_root = dir.path().join("downloads");
    let playlist_root = dir.path().join("m3u8");
    tokio::fs::create_dir_all(&download_root).await.expect("mkdir");
    tokio::fs::create_dir_all(&playlist_root).await.expect("mkdir");

    let store = TaskStore::open_in_memory().await.expect("store");
    let bus = EventBus::new();
    let mut status_stream = bus.subscribe(None);

    let engine = Arc::new(SimTorrentEngine::new(SimProfile {
        total_bytes: 4_096,
        rate_bps: 0,
        metadata_delay: Duration::from_millis(5),
        files: Vec::new(),
    }));
    let downloads = DownloadManager::new(
        Arc::clone(&engine) as Arc<dyn rivulet_torrent_core::TorrentEngine>,
        store.clone(),
        bus.clone(),
        "w1".to_string(),
        5,
    );
    let transcodes = TranscodeManager::new(
        store.clone(),
        bus.clone(),
        Arc::new(PlaylistWritingSegmenter),
        download_root.clone(),
        playlist_root.clone(),
        None,
        3,
    );
    let trigger = transcodes.spawn_trigger();

    // Submit, then materialise the "downloaded" video where the metadata
    // says it will land.
    let task_id = downloads.start_download(MAGNET).await.expect("admit");
    let video_path = download_root.join("pipeline-movie/pipeline-movie.mp4");
    tokio::fs::create_dir_all(video_path.parent().expect("parent"))
        .await
        .expect("mkdir");
    tokio::fs::write(&video_path, vec![7_u8; 4_096])
        .await
        .expect("write video");

    // Let the simulated swarm finish instantly.
    let handle = loop {
        if let Some(handle) = engine.handle_for(MAGNET).await {
            break handle;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    handle.finish();

    // Observe the full monotone status sequence.
    let mut sequence = Vec::new();
    while sequence.last() != Some(&TaskStatus::Ready) {
        let envelope = timeout(Duration::from_secs(30), status_stream.next())
            .await
            .expect("status event in time")
            .expect("bus alive");
        if let Event::StatusChanged { task_id: id, status } = envelope.event {
            assert_eq!(id, task_id);
            if status == TaskStatus::Error {
                panic!("pipeline failed: {sequence:?}");
            }
            sequence.push(status);
        }
    }
    assert_eq!(
        sequence,
        vec![
            TaskStatus::Downloading,
            TaskStatus::Completed,
            TaskStatus::Transcoding,
            TaskStatus::Ready,
        ]
    );

    // Ready implies the playlist exists and the segment list is non-empty.
    let record = store.get(&task_id).await.expect("get").expect("present");
    assert_eq!(record.status, TaskStatus::Ready);
    assert_eq!(record.progress, 100);
    let playlist = record.m3u8_path.expect("playlist path recorded");
    assert!(
        tokio::fs::try_exists(&playlist).await.expect("stat"),
        "playlist file exists on disk"
    );
    assert_eq!(record.segments.len(), 3);
    for segment in &record.segments {
        assert!(
            tokio::fs::try_exists(segment).await.expect("stat"),
            "segment {segment} exists on disk"
        );
    }
    assert_eq!(record.metadata["segment_count"], 3);

    trigger.abort();
}
