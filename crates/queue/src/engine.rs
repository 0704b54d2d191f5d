//! The queue engine: one scheduling tick per call.
//!
//! A tick promotes under the project's writer lock, releases it, awaits the
//! gateway, and then routes every outcome under the lock again. Bulk operations
//! may run while sends are in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use leadflow_core::{LeadId, ProjectId, QueueError, QueueResult};

use crate::audit::{Actor, AuditAction, AuditEntry, AuditLogger, InMemoryAuditLog, TracingAuditSink};
use crate::bulk::BulkOperations;
use crate::config::RuntimeConfig;
use crate::context::QueueContext;
use crate::dispatcher::{Dispatcher, MessageGateway, OutcomeKind};
use crate::lead::QueueStatus;
use crate::metrics::{MetricsAggregator, MetricsRefresher};
use crate::scheduler::Scheduler;
use crate::settings::{QueueSettings, ValidatedSettings};
use crate::store::{InMemoryQueueStore, QueueRecordStore};

/// Counts of one tick that ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub promoted: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
    pub ignored: usize,
    /// Sent leads put back in the queue because their outcome was lost.
    pub released: usize,
    /// Queued leads failed without a send because they were over the retry budget.
    pub exhausted: usize,
    pub window_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// A previous tick of the project is still in flight.
    Busy,
    Ran(TickSummary),
}

impl TickReport {
    pub fn summary(&self) -> Option<&TickSummary> {
        match self {
            Self::Busy => None,
            Self::Ran(summary) => Some(summary),
        }
    }
}

/// Lead automation queue.
///
/// Cheap to share behind an `Arc`; the worker and the bulk facade hold the same
/// context.
#[derive(Debug)]
pub struct LeadQueue {
    ctx: Arc<QueueContext>,
    dispatcher: Dispatcher,
    config: RuntimeConfig,
}

impl LeadQueue {
    pub fn new(
        store: Arc<dyn QueueRecordStore>,
        audit: Arc<dyn AuditLogger>,
        gateway: Arc<dyn MessageGateway>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(QueueContext::new(store, audit)),
            dispatcher: Dispatcher::new(gateway, config.dispatch_timeout),
            config,
        }
    }

    /// Queue backed by the in-memory store and an audit log mirrored to tracing.
    pub fn in_memory(gateway: Arc<dyn MessageGateway>, config: RuntimeConfig) -> Self {
        let audit = InMemoryAuditLog::new().with_sink(Arc::new(TracingAuditSink));
        Self::new(InMemoryQueueStore::arc(), Arc::new(audit), gateway, config)
    }

    pub fn context(&self) -> &Arc<QueueContext> {
        &self.ctx
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    pub fn configure(&self, project_id: ProjectId, settings: &QueueSettings) -> QueueResult<ValidatedSettings> {
        self.ctx.configure(project_id, settings)
    }

    pub fn bulk(&self) -> BulkOperations {
        BulkOperations::new(Arc::clone(&self.ctx))
    }

    pub fn metrics(&self) -> MetricsAggregator {
        MetricsAggregator::new(Arc::clone(&self.ctx))
    }

    /// Start a metrics refresher for a project at the configured interval.
    pub fn start_metrics(&self, project_id: ProjectId) -> MetricsRefresher {
        MetricsRefresher::start(self.metrics(), project_id, self.config.metrics_interval)
    }

    pub async fn tick(&self, project_id: ProjectId) -> QueueResult<TickReport> {
        self.tick_at(project_id, Utc::now()).await
    }

    /// Run one tick as if the clock read `now`.
    ///
    /// Outcomes are timestamped `now` plus the measured send duration.
    pub async fn tick_at(&self, project_id: ProjectId, now: DateTime<Utc>) -> QueueResult<TickReport> {
        let state = self.ctx.project(project_id)?;
        let Some(_tick) = state.try_begin_tick() else {
            debug!(project_id = %project_id, "tick skipped; previous tick still running");
            return Ok(TickReport::Busy);
        };
        let settings = self.ctx.settings(project_id)?;

        let (batch, window_closed, exhausted) = {
            let mut cursor = state.lock_writer()?;
            let snapshot = self.ctx.store().get(project_id)?;

            let exhausted = Scheduler::exhausted(&snapshot, &settings, now);
            if !exhausted.is_empty() {
                self.ctx.audit().append(AuditEntry::new(
                    project_id,
                    Actor::System,
                    AuditAction::RetryExhausted,
                    exhausted.iter().map(|l| l.id).collect(),
                    json!({ "retryAttempts": settings.retry_attempts() }),
                    now,
                ))?;
                warn!(
                    project_id = %project_id,
                    count = exhausted.len(),
                    retry_attempts = settings.retry_attempts(),
                    "queued leads over the retry budget marked failed"
                );
                self.ctx.store().upsert_batch(project_id, exhausted.clone())?;
            }

            let selection = Scheduler::select(&snapshot, &settings, &mut cursor, now);
            let batch = Scheduler::promote(&snapshot, &selection, now);

            // Audit first: a failed append must leave the leads queued.
            if !batch.is_empty() {
                self.ctx.audit().append(AuditEntry::new(
                    project_id,
                    Actor::System,
                    AuditAction::Promote,
                    selection.lead_ids.clone(),
                    json!({ "capacity": selection.capacity, "eligible": selection.eligible }),
                    now,
                ))?;
                self.ctx.store().upsert_batch(project_id, batch.clone())?;
            }
            (batch, selection.window_closed, exhausted.len())
        };

        let mut summary = TickSummary {
            promoted: batch.len(),
            exhausted,
            window_closed,
            ..TickSummary::default()
        };
        if batch.is_empty() {
            debug!(project_id = %project_id, window_closed, "nothing to dispatch");
            return Ok(TickReport::Ran(summary));
        }

        for report in self.dispatcher.dispatch(batch).await {
            let elapsed = chrono::Duration::from_std(report.elapsed).unwrap_or(chrono::Duration::zero());
            let finished_at = now + elapsed;
            match self
                .dispatcher
                .record_outcome(&self.ctx, project_id, &settings, &report, finished_at)
            {
                Ok(OutcomeKind::Completed) => summary.completed += 1,
                Ok(OutcomeKind::RetryScheduled) => summary.retrying += 1,
                Ok(OutcomeKind::PermanentlyFailed) => summary.failed += 1,
                Ok(OutcomeKind::Ignored) => summary.ignored += 1,
                Err(err) => {
                    warn!(project_id = %project_id, lead_id = %report.lead_id, error = %err, "recording dispatch outcome failed");
                    match self.release(project_id, report.lead_id, &err, finished_at) {
                        Ok(true) => summary.released += 1,
                        Ok(false) => {}
                        Err(release_err) => {
                            error!(
                                project_id = %project_id,
                                lead_id = %report.lead_id,
                                error = %release_err,
                                "lead left processing after a lost outcome"
                            );
                        }
                    }
                }
            }
        }

        info!(
            project_id = %project_id,
            promoted = summary.promoted,
            completed = summary.completed,
            retrying = summary.retrying,
            failed = summary.failed,
            ignored = summary.ignored,
            released = summary.released,
            exhausted = summary.exhausted,
            "tick finished"
        );
        Ok(TickReport::Ran(summary))
    }

    /// Put a lead whose outcome could not be recorded back in the queue so it
    /// does not hold a processing slot. The attempt stays counted.
    fn release(
        &self,
        project_id: ProjectId,
        lead_id: LeadId,
        cause: &QueueError,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let state = self.ctx.project(project_id)?;
        let _writer = state.lock_writer()?;
        let Some(mut lead) = self.ctx.store().find(lead_id)? else {
            return Ok(false);
        };
        if lead.project_id != project_id || lead.queue_status != QueueStatus::Processing {
            return Ok(false);
        }
        lead.mark_retry_wait(format!("outcome not recorded: {cause}"), now, now);
        self.ctx.store().upsert_batch(project_id, vec![lead])?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;


    use crate::bulk::Caller;
    use crate::dispatcher::SendOutcome;
    use crate::lead::{LeadSnapshot, LeadStatus, QueueLead};
    use crate::settings::WorkingHours;

    struct AlwaysOk;

    #[async_trait]
    impl MessageGateway for AlwaysOk {
        async fn send(&self, _lead: &QueueLead) -> SendOutcome {
            SendOutcome::Success
        }
    }

    /// Holds every send until released.
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl MessageGateway for Gate {
        async fn send(&self, _lead: &QueueLead) -> SendOutcome {
            self.0.notified().await;
            SendOutcome::Success
        }
    }

    /// Rejects appends of one action, delegating everything else.
    struct RejectingAudit {
        inner: InMemoryAuditLog,
        rejects: AuditAction,
    }

    impl AuditLogger for RejectingAudit {
        fn append(&self, entry: AuditEntry) -> QueueResult<()> {
            if entry.action() == self.rejects {
                return Err(QueueError::storage("audit sink unavailable"));
            }
            self.inner.append(entry)
        }

        fn since(&self, project_id: ProjectId, since: DateTime<Utc>) -> QueueResult<Vec<AuditEntry>> {
            self.inner.since(project_id, since)
        }
    }

    /// Fails every single-record upsert; batches go through.
    struct NoSingleUpserts(InMemoryQueueStore);

    impl QueueRecordStore for NoSingleUpserts {
        fn insert(&self, lead: QueueLead) -> QueueResult<()> {
            self.0.insert(lead)
        }

        fn insert_batch(&self, project_id: ProjectId, leads: Vec<QueueLead>) -> QueueResult<()> {
            self.0.insert_batch(project_id, leads)
        }

        fn get(&self, project_id: ProjectId) -> QueueResult<Vec<QueueLead>> {
            self.0.get(project_id)
        }

        fn find(&self, lead_id: LeadId) -> QueueResult<Option<QueueLead>> {
            self.0.find(lead_id)
        }

        fn upsert(&self, _lead: QueueLead) -> QueueResult<()> {
            Err(QueueError::storage("write refused"))
        }

        fn set_status(&self, lead_id: LeadId, status: QueueStatus) -> QueueResult<()> {
            self.0.set_status(lead_id, status)
        }

        fn upsert_batch(&self, project_id: ProjectId, leads: Vec<QueueLead>) -> QueueResult<()> {
            self.0.upsert_batch(project_id, leads)
        }
    }

    /// Counts sends and always succeeds.
    #[derive(Default)]
    struct Counting(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl MessageGateway for Counting {
        async fn send(&self, _lead: &QueueLead) -> SendOutcome {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            SendOutcome::Success
        }
    }

    fn always_open() -> QueueSettings {
        QueueSettings {
            max_concurrent_processing: 2,
            enable_weekends: true,
            working_hours: WorkingHours {
                start: "00:00".into(),
                end: "00:00".into(),
                timezone: "UTC".into(),
            },
            ..Default::default()
        }
    }

    fn seed(queue: &LeadQueue, project: ProjectId, n: usize) -> Vec<LeadId> {
        let caller = Caller::new(project, Actor::System);
        let snapshots: Vec<_> = (0..n)
            .map(|_| LeadSnapshot {
                id: LeadId::new(),
                project_id: project,
                status: LeadStatus::New,
                heat_score: 9.0,
            })
            .collect();
        let ids: Vec<_> = snapshots.iter().map(|s| s.id).collect();
        queue.bulk().sync_leads(&caller, &snapshots).unwrap();
        queue.bulk().enqueue(&caller, &ids, None).unwrap();
        ids
    }

    #[tokio::test]
    async fn unconfigured_project_is_not_found() {
        let queue = LeadQueue::in_memory(Arc::new(AlwaysOk), RuntimeConfig::default());
        let err = queue.tick(ProjectId::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn tick_dispatches_up_to_capacity() {
        let queue = LeadQueue::in_memory(Arc::new(AlwaysOk), RuntimeConfig::default());
        let project = ProjectId::new();
        queue.configure(project, &always_open()).unwrap();
        let ids = seed(&queue, project, 3);

        let report = queue.tick(project).await.unwrap();

        let summary = report.summary().unwrap();
        assert_eq!(summary.promoted, 2);
        assert_eq!(summary.completed, 2);
        let third = queue.context().store().find(ids[2]).unwrap().unwrap();
        assert_eq!(third.queue_status, QueueStatus::Queued);
        assert_eq!(third.queue_position, Some(1));
    }

    #[tokio::test]
    async fn metrics_refresher_sees_dispatched_leads() {
        let config = RuntimeConfig {
            metrics_interval: Duration::from_secs(3600),
            ..RuntimeConfig::default()
        };
        let queue = LeadQueue::in_memory(Arc::new(AlwaysOk), config);
        let project = ProjectId::new();
        queue.configure(project, &always_open()).unwrap();
        seed(&queue, project, 3);
        queue.tick(project).await.unwrap();

        let refresher = queue.start_metrics(project);
        let mut rx = refresher.subscribe();
        rx.changed().await.unwrap();

        let metrics = rx.borrow().clone();
        assert_eq!(metrics.depth, 1);
        assert_eq!(metrics.completed_today, 2);
        refresher.stop().await;
    }

    #[tokio::test]
    async fn overlapping_tick_reports_busy() {
        let gate = Arc::new(Notify::new());
        let queue = Arc::new(LeadQueue::in_memory(
            Arc::new(Gate(Arc::clone(&gate))),
            RuntimeConfig::default(),
        ));
        let project = ProjectId::new();
        queue.configure(project, &always_open()).unwrap();
        seed(&queue, project, 1);

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.tick(project).await }
        });
        while !queue.context().project(project).unwrap().is_ticking() {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.tick(project).await.unwrap(), TickReport::Busy);

        gate.notify_one();
        let summary = *first.await.unwrap().unwrap().summary().unwrap();
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn removal_during_dispatch_wins_over_the_outcome() {
        let gate = Arc::new(Notify::new());
        let queue = Arc::new(LeadQueue::in_memory(
            Arc::new(Gate(Arc::clone(&gate))),
            RuntimeConfig::default(),
        ));
        let project = ProjectId::new();
        queue.configure(project, &always_open()).unwrap();
        let ids = seed(&queue, project, 1);

        let tick = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.tick(project).await }
        });
        loop {
            let lead = queue.context().store().find(ids[0]).unwrap().unwrap();
            if lead.queue_status == QueueStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        queue
            .bulk()
            .remove(&Caller::new(project, Actor::System), &ids)
            .unwrap();
        gate.notify_one();

        let summary = *tick.await.unwrap().unwrap().summary().unwrap();
        assert_eq!(summary.ignored, 1);
        let lead = queue.context().store().find(ids[0]).unwrap().unwrap();
        assert_eq!(lead.queue_status, QueueStatus::NotQueued);
    }

    #[tokio::test]
    async fn failed_promote_audit_leaves_leads_queued() {
        let gateway = Arc::new(Counting::default());
        let audit = Arc::new(RejectingAudit {
            inner: InMemoryAuditLog::new(),
            rejects: AuditAction::Promote,
        });
        let queue = LeadQueue::new(InMemoryQueueStore::arc(), audit, gateway.clone(), RuntimeConfig::default());
        let project = ProjectId::new();
        queue.configure(project, &always_open()).unwrap();
        let ids = seed(&queue, project, 2);

        let err = queue.tick(project).await.unwrap_err();

        assert!(matches!(err, QueueError::Storage(_)));
        assert_eq!(gateway.0.load(std::sync::atomic::Ordering::SeqCst), 0);
        for id in ids {
            let lead = queue.context().store().find(id).unwrap().unwrap();
            assert_eq!(lead.queue_status, QueueStatus::Queued);
            assert_eq!(lead.attempts, 0);
        }
    }

    #[tokio::test]
    async fn lost_outcome_releases_the_processing_slot() {
        let store = Arc::new(NoSingleUpserts(InMemoryQueueStore::new()));
        let queue = LeadQueue::new(store, InMemoryAuditLog::arc(), Arc::new(AlwaysOk), RuntimeConfig::default());
        let project = ProjectId::new();
        queue.configure(project, &always_open()).unwrap();
        let ids = seed(&queue, project, 1);

        let summary = *queue.tick(project).await.unwrap().summary().unwrap();

        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.released, 1);
        let lead = queue.context().store().find(ids[0]).unwrap().unwrap();
        assert_eq!(lead.queue_status, QueueStatus::Queued);
        assert_eq!(lead.attempts, 1);
        assert!(lead.last_error.unwrap().contains("write refused"));
    }
}
