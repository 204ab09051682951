use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Priority;

/// Job lifecycle notifications published by the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Enqueued {
        lane: Priority,
        job_id: Uuid,
        provider_id: Uuid,
    },
    Duplicate {
        lane: Priority,
        idempotency_key: String,
    },
    Active {
        lane: Priority,
        job_id: Uuid,
        attempt: i32,
    },
    Completed {
        lane: Priority,
        job_id: Uuid,
        provider_id: Uuid,
        duration: Duration,
    },
    Retrying {
        lane: Priority,
        job_id: Uuid,
        attempt: i32,
        run_at: DateTime<Utc>,
    },
    Failed {
        lane: Priority,
        job_id: Uuid,
        provider_id: Uuid,
        error: String,
    },
    Stalled {
        lane: Priority,
        job_id: Uuid,
    },
}

#[derive(Debug, Default)]
struct LaneMetrics {
    completed: AtomicU64,
    failed: AtomicU64,
    last_duration_ms: AtomicU64,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LaneSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub last_duration_ms: u64,
    pub average_duration_ms: u64,
}

/// Per-lane completed/failed counters and durations, fed from `JobEvent`s.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    high: LaneMetrics,
    normal: LaneMetrics,
    low: LaneMetrics,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, lane: Priority) -> &LaneMetrics {
        match lane {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    pub fn record(&self, event: &JobEvent) {
        match event {
            JobEvent::Completed { lane, duration, .. } => {
                let metrics = self.lane(*lane);
                let ms = duration.as_millis() as u64;
                metrics.completed.fetch_add(1, Ordering::Relaxed);
                metrics.last_duration_ms.store(ms, Ordering::Relaxed);
                metrics.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
            }
            JobEvent::Failed { lane, .. } => {
                self.lane(*lane).failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self, lane: Priority) -> LaneSnapshot {
        let metrics = self.lane(lane);
        let completed = metrics.completed.load(Ordering::Relaxed);
        let total = metrics.total_duration_ms.load(Ordering::Relaxed);
        LaneSnapshot {
            completed,
            failed: metrics.failed.load(Ordering::Relaxed),
            last_duration_ms: metrics.last_duration_ms.load(Ordering::Relaxed),
            average_duration_ms: if completed == 0 { 0 } else { total / completed },
        }
    }

    /// Consumes queue events until cancelled.
    pub fn spawn_listener(
        self: Arc<Self>,
        mut events: broadcast::Receiver<JobEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => self.record(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Queue metrics listener lagged behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
