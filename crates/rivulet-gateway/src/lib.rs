//! Gateway broker: registry, routing, fan-out, and signaling relay.
//!
//! The gateway holds no media. It tracks worker liveness, binds signaling
//! sessions between clients and workers, fans broadcast requests out across
//! the online worker set, and relays SDP/ICE payloads without inspecting
//! them.

pub mod correlator;
pub mod http;
pub mod hub;
pub mod ice;
pub mod registry;
pub mod relay;
pub mod sessions;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rivulet_config::GatewayAppConfig;
use tracing::{debug, info};

use crate::correlator::RequestCorrelator;
use crate::hub::ConnectionHub;
use crate::ice::IceServerProvider;
use crate::registry::WorkerRegistry;
use crate::sessions::SessionTable;

/// Interval between maintenance sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<WorkerRegistry>,
    pub sessions: Arc<SessionTable>,
    pub hub: Arc<ConnectionHub>,
    pub correlator: Arc<RequestCorrelator>,
    pub ice: Arc<IceServerProvider>,
}

impl GatewayState {
    /// Wire up a fresh gateway from configuration.
    #[must_use]
    pub fn new(config: &GatewayAppConfig) -> Self {
        Self {
            registry: Arc::new(WorkerRegistry::new()),
            sessions: Arc::new(SessionTable::new()),
            hub: Arc::new(ConnectionHub::new()),
            correlator: Arc::new(RequestCorrelator::new()),
            ice: Arc::new(IceServerProvider::new(config.turn.clone())),
        }
    }
}

/// Launch the periodic maintenance sweep.
///
/// Every 30 s: stale workers are marked offline (2 min) or evicted (10 min,
/// which also detaches their live connection and cancels correlator
/// interest), sessions older than one hour are dropped, and expired pending
/// requests are reclaimed.
pub fn spawn_sweeper(state: GatewayState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();

            let report = state.registry.sweep_at(now);
            for node_id in &report.offlined {
                info!(node_id = %node_id, "worker marked offline");
            }
            for node_id in &report.evicted {
                info!(node_id = %node_id, "worker evicted");
                state.hub.detach_worker(node_id);
                state.correlator.worker_disconnected(node_id);
            }

            for session_id in state.sessions.sweep_at(now) {
                debug!(session_id = %session_id, "expired signaling session dropped");
            }

            state.correlator.sweep();
        }
    })
}
