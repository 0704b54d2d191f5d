//! Dispatch of promoted leads to the messaging gateway, and outcome routing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use leadflow_core::{LeadId, ProjectId, QueueError, QueueResult};

use crate::audit::{Actor, AuditAction, AuditEntry};
use crate::context::QueueContext;
use crate::lead::{QueueLead, QueueStatus};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::settings::ValidatedSettings;

/// Answer of the messaging gateway for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Failure(String),
}

/// External messaging gateway (WhatsApp outreach). Wire format is its concern.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send(&self, lead: &QueueLead) -> SendOutcome;
}

#[async_trait]
impl<G> MessageGateway for Arc<G>
where
    G: MessageGateway + ?Sized,
{
    async fn send(&self, lead: &QueueLead) -> SendOutcome {
        (**self).send(lead).await
    }
}

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub lead_id: LeadId,
    /// `DispatchFailure` or `DispatchTimeout` on error.
    pub result: Result<(), QueueError>,
    pub elapsed: Duration,
}

/// How an outcome was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    RetryScheduled,
    PermanentlyFailed,
    /// The lead left `processing` while the send was in flight.
    Ignored,
}

/// Sends promoted leads and routes their outcomes.
///
/// Only sends what it is handed; it never selects leads by itself.
pub struct Dispatcher {
    gateway: Arc<dyn MessageGateway>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn MessageGateway>, timeout: Duration) -> Self {
        Self { gateway, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send every lead of the batch concurrently, each bounded by the timeout.
    pub async fn dispatch(&self, batch: Vec<QueueLead>) -> Vec<DispatchReport> {
        let ids: Vec<LeadId> = batch.iter().map(|l| l.id).collect();
        let mut tasks = JoinSet::new();

        for lead in batch {
            let gateway = Arc::clone(&self.gateway);
            let timeout = self.timeout;
            tasks.spawn(async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, gateway.send(&lead)).await {
                    Ok(SendOutcome::Success) => Ok(()),
                    Ok(SendOutcome::Failure(reason)) => Err(QueueError::DispatchFailure(reason)),
                    Err(_) => Err(QueueError::DispatchTimeout),
                };
                DispatchReport {
                    lead_id: lead.id,
                    result,
                    elapsed: started.elapsed(),
                }
            });
        }

        let mut reports = Vec::with_capacity(ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => warn!(error = %err, "dispatch task did not complete"),
            }
        }

        // A panicked send still owes the lead an outcome.
        for id in ids {
            if !reports.iter().any(|r| r.lead_id == id) {
                reports.push(DispatchReport {
                    lead_id: id,
                    result: Err(QueueError::DispatchFailure("dispatch task aborted".to_string())),
                    elapsed: Duration::ZERO,
                });
            }
        }

        reports
    }

    /// Apply one outcome to the store under the project's writer lock.
    ///
    /// If the lead is no longer `processing` (removed meanwhile) the outcome is
    /// recorded as ignored and produces no transition.
    pub fn record_outcome(
        &self,
        ctx: &QueueContext,
        project_id: ProjectId,
        settings: &ValidatedSettings,
        report: &DispatchReport,
        finished_at: DateTime<Utc>,
    ) -> QueueResult<OutcomeKind> {
        let state = ctx.project(project_id)?;
        let _writer = state.lock_writer()?;

        let mut lead = ctx
            .store()
            .find(report.lead_id)?
            .ok_or_else(|| QueueError::lead_not_found(report.lead_id))?;
        if lead.project_id != project_id {
            return Err(QueueError::cross_project(lead.id, project_id));
        }

        let duration_ms = report.elapsed.as_millis() as u64;

        if lead.queue_status != QueueStatus::Processing {
            info!(
                project_id = %project_id,
                lead_id = %lead.id,
                queue_status = %lead.queue_status,
                "dispatch outcome for lead no longer processing; ignored"
            );
            ctx.audit().append(AuditEntry::new(
                project_id,
                Actor::System,
                AuditAction::DispatchIgnored,
                vec![lead.id],
                json!({
                    "queueStatus": lead.queue_status.as_str(),
                    "succeeded": report.result.is_ok(),
                    "durationMs": duration_ms,
                }),
                finished_at,
            ))?;
            return Ok(OutcomeKind::Ignored);
        }

        let (kind, entry) = match &report.result {
            Ok(()) => {
                lead.mark_completed(finished_at);
                debug!(project_id = %project_id, lead_id = %lead.id, "lead dispatched");
                let entry = AuditEntry::new(
                    project_id,
                    Actor::System,
                    AuditAction::DispatchSuccess,
                    vec![lead.id],
                    json!({ "attempts": lead.attempts, "durationMs": duration_ms }),
                    finished_at,
                );
                (OutcomeKind::Completed, entry)
            }
            Err(err) => {
                let reason = err.audit_reason();
                let decision = if err.is_retryable() {
                    RetryPolicy::from_settings(settings).decide(lead.attempts)
                } else {
                    RetryDecision::PermanentFailure
                };
                let retry_at = decision.retry_at(finished_at);

                let kind = match (decision, retry_at) {
                    (RetryDecision::RetryAfter(_), Some(at)) => {
                        lead.mark_retry_wait(reason.clone(), at, finished_at);
                        OutcomeKind::RetryScheduled
                    }
                    _ => {
                        lead.mark_failed(reason.clone(), finished_at);
                        OutcomeKind::PermanentlyFailed
                    }
                };

                warn!(
                    project_id = %project_id,
                    lead_id = %lead.id,
                    attempts = lead.attempts,
                    reason = %reason,
                    retry_at = ?retry_at,
                    "lead dispatch failed"
                );

                let entry = AuditEntry::new(
                    project_id,
                    Actor::System,
                    AuditAction::DispatchFailure,
                    vec![lead.id],
                    json!({
                        "reason": reason,
                        "attempts": lead.attempts,
                        "durationMs": duration_ms,
                        "retryAt": retry_at,
                        "permanent": kind == OutcomeKind::PermanentlyFailed,
                    }),
                    finished_at,
                );
                (kind, entry)
            }
        };

        ctx.store().upsert(lead)?;
        ctx.audit().append(entry)?;
        Ok(kind)
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
