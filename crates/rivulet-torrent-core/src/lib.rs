//! Engine-agnostic torrent interfaces and DTOs shared across the workspace.
//!
//! The torrent protocol itself is an external collaborator: the download
//! pipeline only ever talks to [`TorrentEngine`] and [`TorrentHandle`], so a
//! native engine adapter slots in without touching the task state machine.
//! [`sim`] provides the deterministic engine used by tests and engine-less
//! builds.

pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use rivulet_events::InventoryFile;

/// Public trackers appended to every magnet to accelerate metadata
/// acquisition. The list is fixed at build time; order does not matter.
pub const DEFAULT_PUBLIC_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "udp://open.stealth.si:80/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://explodie.org:6969/announce",
    "http://tracker.opentrackr.org:1337/announce",
    "http://tracker.openbittorrent.com:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://tracker.moeking.me:6969/announce",
    "udp://bt.oiyo.tk:6969/announce",
    "https://tracker.nanoha.org:443/announce",
    "https://tracker.lilithraws.org:443/announce",
];

/// Torrent metadata as resolved from the swarm.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    /// Display name of the torrent.
    pub name: String,
    /// Total payload size in bytes.
    pub total_bytes: u64,
    /// File inventory, in torrent order.
    pub files: Vec<InventoryFile>,
}

/// Primary engine trait implemented by adapters.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Admit a magnet URI, augmenting it with `trackers`, and return a live
    /// handle. Admission succeeds before metadata is known.
    async fn add_magnet(
        &self,
        uri: &str,
        trackers: &[&str],
    ) -> anyhow::Result<Arc<dyn TorrentHandle>>;
}

/// Live torrent owned by an engine.
#[async_trait]
pub trait TorrentHandle: Send + Sync {
    /// Resolve the torrent's metadata. Idempotent; callers impose their own
    /// deadline.
    async fn metadata(&self) -> anyhow::Result<TorrentMetadata>;

    /// Begin fetching the whole torrent.
    async fn start(&self) -> anyhow::Result<()>;

    /// Bytes fetched so far.
    async fn bytes_completed(&self) -> u64;

    /// Detach the handle, releasing the engine's live resources for it.
    /// Fetched data stays on disk.
    async fn shutdown(&self);
}

/// Extract the `dn` (display name) parameter from a magnet URI, if present.
#[must_use]
pub fn magnet_display_name(uri: &str) -> Option<String> {
    uri.split_once('?')?
        .1
        .split('&')
        .find_map(|pair| pair.strip_prefix("dn="))
        .map(|name| name.replace('+', " "))
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_extraction() {
        assert_eq!(
            magnet_display_name("magnet:?xt=urn:btih:AAA&dn=Some+Movie&tr=x"),
            Some("Some Movie".to_string())
        );
        assert_eq!(magnet_display_name("magnet:?xt=urn:btih:AAA"), None);
        assert_eq!(magnet_display_name("magnet:?dn=&xt=urn:btih:AAA"), None);
        assert_eq!(magnet_display_name("not-a-magnet"), None);
    }

    #[test]
    fn tracker_list_is_nonempty_and_schemed() {
        assert!(!DEFAULT_PUBLIC_TRACKERS.is_empty());
        for tracker in DEFAULT_PUBLIC_TRACKERS {
            assert!(
                tracker.starts_with("udp://")
                    || tracker.starts_with("http://")
                    || tracker.starts_with("https://"),
                "unexpected tracker scheme: {tracker}"
            );
        }
    }
}
