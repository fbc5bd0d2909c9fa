use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{DispatchError, Result},
    routing::{JobType, Queue},
    runs::RunLifecycleManager,
    types::Parameters,
};

/// One unit of work handed to the execution layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Correlation back to the persisted run.
    pub run_id: String,
    pub template_ref: String,
    pub job_type: JobType,
    pub parameters: Parameters,
    pub target_scope: Vec<String>,
    pub queue: Queue,
}

/// Boundary to the external execution layer (a broker, a worker pool, …).
///
/// `submit` must not block on the work itself: it returns as soon as the
/// request is accepted, with an execution id the worker will echo back in
/// its [`DispatchEvent`]s. Any error means the request was not accepted.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, request: DispatchRequest) -> std::result::Result<String, DispatchError>;
}

/// A submitted request as it sits on a lane. Workers drop it unprocessed
/// once `expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    pub dispatch_id: String,
    #[serde(flatten)]
    pub request: DispatchRequest,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DispatchEnvelope {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-process dispatcher: one bounded tokio mpsc lane per [`Queue`].
///
/// The receiving halves are returned from [`ChannelDispatcher::new`] and are
/// owned by whatever drives the workers (the daemon bridges them to stdout).
pub struct ChannelDispatcher {
    lanes: HashMap<Queue, mpsc::Sender<DispatchEnvelope>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

pub type LaneReceivers = HashMap<Queue, mpsc::Receiver<DispatchEnvelope>>;

impl ChannelDispatcher {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> (Self, LaneReceivers) {
        let mut lanes = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in Queue::ALL {
            let (tx, rx) = mpsc::channel(capacity);
            lanes.insert(queue, tx);
            receivers.insert(queue, rx);
        }
        (Self { lanes, ttl, clock }, receivers)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn submit(&self, request: DispatchRequest) -> std::result::Result<String, DispatchError> {
        let queue = request.queue;
        let lane = self
            .lanes
            .get(&queue)
            .ok_or(DispatchError::UnknownLane { queue })?;

        let now = self.clock.now();
        let envelope = DispatchEnvelope {
            dispatch_id: Uuid::new_v4().to_string(),
            request,
            submitted_at: now,
            expires_at: now + self.ttl,
        };
        let dispatch_id = envelope.dispatch_id.clone();

        // try_send: a full lane is reported, never waited on.
        lane.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::LaneFull { queue },
            mpsc::error::TrySendError::Closed(_) => DispatchError::LaneClosed { queue },
        })?;
        debug!(%queue, %dispatch_id, "request queued");
        Ok(dispatch_id)
    }
}

/// Progress reported by the execution layer. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Started {
        run_id: String,
        dispatch_id: String,
    },
    Heartbeat {
        run_id: String,
    },
    Completed {
        run_id: String,
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed {
        run_id: String,
        error: String,
    },
    Cancelled {
        run_id: String,
    },
}

impl DispatchEvent {
    pub fn run_id(&self) -> &str {
        match self {
            DispatchEvent::Started { run_id, .. }
            | DispatchEvent::Heartbeat { run_id }
            | DispatchEvent::Completed { run_id, .. }
            | DispatchEvent::Failed { run_id, .. }
            | DispatchEvent::Cancelled { run_id } => run_id,
        }
    }
}

/// Applies execution-layer events to the run store.
pub struct CompletionListener {
    runs: Arc<RunLifecycleManager>,
}

impl CompletionListener {
    pub fn new(runs: Arc<RunLifecycleManager>) -> Self {
        Self { runs }
    }

    /// Apply one event. Returns whether it changed the run; duplicates and
    /// out-of-order events are ignored.
    pub fn apply(&self, event: &DispatchEvent) -> Result<bool> {
        let applied = match event {
            DispatchEvent::Started {
                run_id,
                dispatch_id,
            } => self.runs.mark_started(run_id, dispatch_id)?.is_some(),
            DispatchEvent::Heartbeat { run_id } => self.runs.heartbeat(run_id)?,
            DispatchEvent::Completed { run_id, result } => {
                self.runs.mark_completed(run_id, result.clone())?.is_some()
            }
            DispatchEvent::Failed { run_id, error } => {
                self.runs.mark_failed(run_id, error)?.is_some()
            }
            DispatchEvent::Cancelled { run_id } => self.runs.mark_cancelled(run_id)?.is_some(),
        };
        Ok(applied)
    }

    /// Drain `events` until the channel closes or `shutdown` broadcasts `true`.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<DispatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("completion listener started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("event channel closed, completion listener stopping");
                        break;
                    };
                    match self.apply(&event) {
                        Ok(true) => {}
                        Ok(false) => debug!(run_id = %event.run_id(), "event ignored"),
                        Err(e) => error!(run_id = %event.run_id(), "applying event failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("completion listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}
