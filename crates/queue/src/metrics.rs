//! Queue metrics, derived from the store snapshot and today's audit entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use leadflow_core::{ProjectId, QueueResult};

use crate::audit::AuditAction;
use crate::context::QueueContext;
use crate::lead::QueueStatus;

/// Derived metrics. Never mutated independently; recompute instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub depth: usize,
    pub processing: usize,
    pub completed_today: usize,
    pub failed_today: usize,
    /// `completed / (completed + failed)`, 0 when nothing finished today.
    pub success_rate: f64,
    pub avg_processing_time_seconds: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Side-effect-free recomputation of `QueueMetrics`.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    ctx: Arc<QueueContext>,
}

impl MetricsAggregator {
    pub fn new(ctx: Arc<QueueContext>) -> Self {
        Self { ctx }
    }

    pub fn compute(&self, project_id: ProjectId) -> QueueResult<QueueMetrics> {
        self.compute_at(project_id, Utc::now())
    }

    /// "Today" is the local day of the project's timezone.
    pub fn compute_at(&self, project_id: ProjectId, now: DateTime<Utc>) -> QueueResult<QueueMetrics> {
        let settings = self.ctx.settings(project_id)?;
        let leads = self.ctx.store().get(project_id)?;
        let since = settings.start_of_local_day(now);

        let mut metrics = QueueMetrics {
            last_updated: Some(now),
            ..QueueMetrics::default()
        };

        for lead in &leads {
            match lead.queue_status {
                QueueStatus::Queued => metrics.depth += 1,
                QueueStatus::Processing => metrics.processing += 1,
                _ => {}
            }
        }

        let mut total_ms = 0u64;
        let mut timed = 0u64;
        for entry in self
            .ctx
            .audit()
            .since(project_id, since)?
            .iter()
            .filter(|e| e.action().is_dispatch_outcome() && e.timestamp() <= now)
        {
            let count = entry.lead_ids().len();
            match entry.action() {
                AuditAction::DispatchSuccess => metrics.completed_today += count,
                AuditAction::DispatchFailure => metrics.failed_today += count,
                _ => {}
            }
            if let Some(ms) = entry.metadata().get("durationMs").and_then(|v| v.as_u64()) {
                total_ms += ms;
                timed += 1;
            }
        }

        let finished = metrics.completed_today + metrics.failed_today;
        if finished > 0 {
            metrics.success_rate = metrics.completed_today as f64 / finished as f64;
        }
        if timed > 0 {
            metrics.avg_processing_time_seconds = total_ms as f64 / timed as f64 / 1000.0;
        }

        Ok(metrics)
    }
}

/// Handle to a running metrics refresh task.
///
/// Consumers either poll `latest()` or await changes on `subscribe()`.
#[derive(Debug)]
pub struct MetricsRefresher {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    latest: watch::Receiver<QueueMetrics>,
}

impl MetricsRefresher {
    /// Recompute immediately and then every `interval` until stopped.
    pub fn start(aggregator: MetricsAggregator, project_id: ProjectId, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(QueueMetrics::default());
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let join = tokio::spawn(async move {
            tracing::info!(project_id = %project_id, "metrics refresher started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {
                        match aggregator.compute(project_id) {
                            Ok(metrics) => {
                                if tx.send(metrics).is_err() {
                                    // Every receiver is gone.
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(project_id = %project_id, error = %err, "metrics recomputation failed");
                            }
                        }
                    }
                }
            }

            tracing::info!(project_id = %project_id, "metrics refresher stopped");
        });

        Self {
            shutdown,
            join: Some(join),
            latest: rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueMetrics> {
        self.latest.clone()
    }

    pub fn latest(&self) -> QueueMetrics {
        self.latest.borrow().clone()
    }

    /// Request shutdown and wait for the task to finish.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for MetricsRefresher {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
