//! Background scheduling loop of one project.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use leadflow_core::{ProjectId, QueueResult};

use crate::engine::{LeadQueue, TickReport};

/// Handle to control and join a running queue worker.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    project_id: ProjectId,
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl QueueWorkerHandle {
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Request shutdown and wait for the worker to stop.
    ///
    /// A tick already in flight runs to completion first.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(project_id = %self.project_id, error = %err, "queue worker ended abnormally");
            }
        }
    }
}

impl Drop for QueueWorkerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[derive(Debug)]
pub struct QueueWorker;

impl QueueWorker {
    /// Spawn a task that ticks the project every `interval`, and early whenever
    /// a bulk operation changes the queue.
    pub fn spawn(queue: Arc<LeadQueue>, project_id: ProjectId, interval: Duration) -> QueueResult<QueueWorkerHandle> {
        let state = queue.context().project(project_id)?;
        let shutdown = Arc::new(Notify::new());
        let stop = Arc::clone(&shutdown);

        let join = tokio::spawn(async move {
            info!(project_id = %project_id, interval_secs = interval.as_secs(), "queue worker started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticker.tick() => {}
                    _ = state.woken() => {}
                }

                match queue.tick(project_id).await {
                    Ok(TickReport::Busy) => debug!(project_id = %project_id, "tick still running"),
                    Ok(TickReport::Ran(_)) => {}
                    Err(err) => warn!(project_id = %project_id, error = %err, "queue tick failed"),
                }
            }

            info!(project_id = %project_id, "queue worker stopped");
        });

        Ok(QueueWorkerHandle {
            project_id,
            shutdown,
            join: Some(join),
        })
    }

    /// Spawn with the queue's configured tick interval.
    pub fn spawn_default(queue: Arc<LeadQueue>, project_id: ProjectId) -> QueueResult<QueueWorkerHandle> {
        let interval = queue.config().tick_interval;
        Self::spawn(queue, project_id, interval)
    }
}
