//! Worker registry with heartbeat-driven liveness.
//!
//! Records live in a `BTreeMap` behind one reader/writer lock, so sweep
//! ordering is deterministic by worker id. No operation touches the network
//! while holding the lock; eviction side effects (connection teardown,
//! fan-out cancellation) are the sweeper's job, driven by the returned
//! report.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rivulet_proto::{NodeRecord, NodeStatus};

/// Silence threshold after which a worker is marked offline.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(2 * 60);

/// Silence threshold after which a worker record is removed entirely.
pub const EVICT_AFTER: Duration = Duration::from_secs(10 * 60);

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A heartbeat referenced a worker that never registered (or was
    /// evicted). The caller must ignore the worker until it re-registers.
    #[error("worker {node_id} is not registered")]
    NotRegistered { node_id: String },
}

#[derive(Debug, Clone)]
struct StoredNode {
    record: NodeRecord,
    last_seen: DateTime<Utc>,
}

/// Outcome of one maintenance sweep, ordered by worker id.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub offlined: Vec<String>,
    pub evicted: Vec<String>,
}

/// In-memory worker registry keyed by worker id.
#[derive(Default)]
pub struct WorkerRegistry {
    nodes: RwLock<BTreeMap<String, StoredNode>>,
}

impl WorkerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a worker record, forcing it online and stamping `last_seen`.
    /// Idempotent: re-registration refreshes the stored record.
    pub fn register(&self, mut record: NodeRecord) {
        record.status = NodeStatus::Online;
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        nodes.insert(
            record.id.clone(),
            StoredNode {
                record,
                last_seen: Utc::now(),
            },
        );
    }

    /// Refresh a worker's liveness stamp.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] when the id is unknown; no
    /// record is created in that case.
    pub fn heartbeat(&self, node_id: &str) -> Result<(), RegistryError> {
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        match nodes.get_mut(node_id) {
            Some(stored) => {
                stored.last_seen = Utc::now();
                stored.record.status = NodeStatus::Online;
                Ok(())
            }
            None => Err(RegistryError::NotRegistered {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Snapshot of all currently online workers, ordered by id.
    #[must_use]
    pub fn online(&self) -> Vec<NodeRecord> {
        let nodes = self.nodes.read().expect("registry lock poisoned");
        nodes
            .values()
            .filter(|stored| stored.record.status == NodeStatus::Online)
            .map(|stored| stored.record.clone())
            .collect()
    }

    /// One worker record by id.
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        let nodes = self.nodes.read().expect("registry lock poisoned");
        nodes.get(node_id).map(|stored| stored.record.clone())
    }

    /// Remove a record outright.
    pub fn remove(&self, node_id: &str) {
        let mut nodes = self.nodes.write().expect("registry lock poisoned");
        nodes.remove(node_id);
    }

    /// Total and online record counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let nodes = self.nodes.read().expect("registry lock poisoned");
        let online = nodes
            .values()
            .filter(|stored| stored.record.status == NodeStatus::Online)
            .count();
        (nodes.len(), online)
    }

    /// Mark workers silent for more than [`OFFLINE_AFTER`] offline and drop
    /// those silent for more than [`EVICT_AFTER`], reporting both sets in
    /// id order.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let offline_cutoff =
            chrono::Duration::from_std(OFFLINE_AFTER).expect("offline threshold fits");
        let evict_cutoff = chrono::Duration::from_std(EVICT_AFTER).expect("evict threshold fits");

        let mut report = SweepReport::default();
        let mut nodes = self.nodes.write().expect("registry lock poisoned");

        nodes.retain(|node_id, stored| {
            let silence = now - stored.last_seen;
            if silence > evict_cutoff {
                report.evicted.push(node_id.clone());
                return false;
            }
            if silence > offline_cutoff && stored.record.status == NodeStatus::Online {
                stored.record.status = NodeStatus::Offline;
                report.offlined.push(node_id.clone());
            }
            true
        });

        report
    }
}
