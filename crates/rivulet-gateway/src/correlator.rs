//! Request correlator for broadcast fan-out.
//!
//! A fan-out snapshots the online worker set, sends `get_tasks` to each, and
//! collects `tasks_response` frames under one request id. Completion fires
//! when every outstanding worker has answered or been ruled out (send
//! failure, disconnect); the HTTP handler imposes the 30 s deadline and
//! takes whatever partial accumulation exists when it fires. Response
//! channels are buffered with capacity 1 so late senders never block, and a
//! periodic sweep reclaims entries whose waiter has gone away.
//!
//! Single-worker probes (`get_task_detail`) share the table shape but
//! correlate by task id and complete on the first affirmative answer.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rivulet_proto::{TaskDetail, TaskSummary};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Deadline for pending fan-out requests.
pub const FANOUT_DEADLINE: Duration = Duration::from_secs(30);

struct PendingFanout {
    outstanding: HashSet<String>,
    responses: Vec<TaskSummary>,
    tx: mpsc::Sender<Vec<TaskSummary>>,
    created_at: Instant,
}

struct PendingDetail {
    outstanding: HashSet<String>,
    tx: mpsc::Sender<Option<TaskDetail>>,
    created_at: Instant,
}

#[derive(Default)]
struct CorrelatorState {
    fanouts: HashMap<String, PendingFanout>,
    details: HashMap<String, PendingDetail>,
}

/// Correlates broadcast requests with their per-worker responses.
#[derive(Default)]
pub struct RequestCorrelator {
    state: Mutex<CorrelatorState>,
}

impl RequestCorrelator {
    /// Empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fan-out over `workers` and return its request id plus the
    /// completion channel. An empty worker set completes immediately with an
    /// empty list.
    #[must_use]
    pub fn begin_fanout(&self, workers: &[String]) -> (String, mpsc::Receiver<Vec<TaskSummary>>) {
        let request_id = format!("req_{}", Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(1);

        if workers.is_empty() {
            let _ = tx.try_send(Vec::new());
            return (request_id, rx);
        }

        let mut state = self.state.lock().expect("correlator lock poisoned");
        state.fanouts.insert(
            request_id.clone(),
            PendingFanout {
                outstanding: workers.iter().cloned().collect(),
                responses: Vec::new(),
                tx,
                created_at: Instant::now(),
            },
        );
        (request_id, rx)
    }

    /// Rule a worker out of a fan-out after its send failed. May complete
    /// the request; with every send failed this resolves the fan-out to an
    /// empty list immediately.
    pub fn mark_unreachable(&self, request_id: &str, node_id: &str) {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        if let Some(pending) = state.fanouts.get_mut(request_id) {
            pending.outstanding.remove(node_id);
            if pending.outstanding.is_empty() {
                Self::complete_fanout(&mut state, request_id);
            }
        }
    }

    /// Record one worker's task list. Responses for unknown or already
    /// completed request ids are dropped.
    pub fn record_tasks(&self, request_id: &str, node_id: &str, tasks: Vec<TaskSummary>) {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        let Some(pending) = state.fanouts.get_mut(request_id) else {
            debug!(request_id = %request_id, node_id = %node_id, "dropping late tasks response");
            return;
        };
        if !pending.outstanding.remove(node_id) {
            debug!(request_id = %request_id, node_id = %node_id, "dropping duplicate tasks response");
            return;
        }

        pending.responses.extend(tasks.into_iter().map(|mut task| {
            task.worker_id = node_id.to_string();
            task
        }));

        if pending.outstanding.is_empty() {
            Self::complete_fanout(&mut state, request_id);
        }
    }

    /// Take the partial accumulation for a request, abandoning it. Used by
    /// the deadline path so timed-out callers still see what arrived.
    #[must_use]
    pub fn take_partial(&self, request_id: &str) -> Vec<TaskSummary> {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        state
            .fanouts
            .remove(request_id)
            .map(|pending| pending.responses)
            .unwrap_or_default()
    }

    /// Register a detail probe over `workers`, correlated by task id. An
    /// empty worker set completes immediately as not-found.
    #[must_use]
    pub fn begin_detail(
        &self,
        task_id: &str,
        workers: &[String],
    ) -> mpsc::Receiver<Option<TaskDetail>> {
        let (tx, rx) = mpsc::channel(1);

        if workers.is_empty() {
            let _ = tx.try_send(None);
            return rx;
        }

        let mut state = self.state.lock().expect("correlator lock poisoned");
        state.details.insert(
            task_id.to_string(),
            PendingDetail {
                outstanding: workers.iter().cloned().collect(),
                tx,
                created_at: Instant::now(),
            },
        );
        rx
    }

    /// Rule a worker out of a detail probe after its send failed.
    pub fn mark_detail_unreachable(&self, task_id: &str, node_id: &str) {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        if let Some(pending) = state.details.get_mut(task_id) {
            pending.outstanding.remove(node_id);
            if pending.outstanding.is_empty() {
                Self::complete_detail(&mut state, task_id, None);
            }
        }
    }

    /// Record one worker's detail answer. The first affirmative answer wins;
    /// a full set of negatives resolves to not-found.
    pub fn record_detail(
        &self,
        task_id: &str,
        node_id: &str,
        found: bool,
        task: Option<TaskDetail>,
    ) {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        let Some(pending) = state.details.get_mut(task_id) else {
            debug!(task_id = %task_id, node_id = %node_id, "dropping late detail response");
            return;
        };
        pending.outstanding.remove(node_id);

        if found {
            let mut task = task;
            if let Some(task) = task.as_mut() {
                task.worker_id = node_id.to_string();
            }
            Self::complete_detail(&mut state, task_id, task);
        } else if pending.outstanding.is_empty() {
            Self::complete_detail(&mut state, task_id, None);
        }
    }

    /// Cancel interest in a disconnected worker across every pending
    /// request, completing any request whose expectation is now met.
    pub fn worker_disconnected(&self, node_id: &str) {
        let mut state = self.state.lock().expect("correlator lock poisoned");

        let completed: Vec<String> = state
            .fanouts
            .iter_mut()
            .filter_map(|(request_id, pending)| {
                pending.outstanding.remove(node_id);
                pending.outstanding.is_empty().then(|| request_id.clone())
            })
            .collect();
        for request_id in completed {
            Self::complete_fanout(&mut state, &request_id);
        }

        let completed: Vec<String> = state
            .details
            .iter_mut()
            .filter_map(|(task_id, pending)| {
                pending.outstanding.remove(node_id);
                pending.outstanding.is_empty().then(|| task_id.clone())
            })
            .collect();
        for task_id in completed {
            Self::complete_detail(&mut state, &task_id, None);
        }
    }

    /// Reclaim pending entries older than [`FANOUT_DEADLINE`]. Backstop for
    /// waiters that vanished without taking their partials.
    pub fn sweep(&self) {
        let mut state = self.state.lock().expect("correlator lock poisoned");
        state
            .fanouts
            .retain(|_, pending| pending.created_at.elapsed() <= FANOUT_DEADLINE);
        state
            .details
            .retain(|_, pending| pending.created_at.elapsed() <= FANOUT_DEADLINE);
    }

    /// Number of pending requests of either kind.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().expect("correlator lock poisoned");
        state.fanouts.len() + state.details.len()
    }

    fn complete_fanout(state: &mut CorrelatorState, request_id: &str) {
        if let Some(pending) = state.fanouts.remove(request_id) {
            let _ = pending.tx.try_send(pending.responses);
        }
    }

    fn complete_detail(state: &mut CorrelatorState, task_id: &str, task: Option<TaskDetail>) {
        if let Some(pending) = state.details.remove(task_id) {
            let _ = pending.tx.try_send(task);
        }
    }
}
