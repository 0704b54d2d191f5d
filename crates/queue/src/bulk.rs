//! Bulk operations: the only mutation surface exposed to callers.
//!
//! Every call validates all ids first (`NotFound` / `Forbidden`), applies the
//! change through one atomic store write, writes exactly one audit entry for the
//! whole batch, and wakes the project's worker for an early tick. Nothing is
//! applied when validation fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use leadflow_core::{LeadId, ProjectId, QueueError, QueueResult};

use crate::audit::{Actor, AuditAction, AuditEntry};
use crate::context::QueueContext;
use crate::lead::{LeadSnapshot, LeadStatus, Priority, QueueLead};

/// Who is calling, and on behalf of which project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub project_id: ProjectId,
    pub actor: Actor,
}

impl Caller {
    pub fn new(project_id: ProjectId, actor: Actor) -> Self {
        Self { project_id, actor }
    }
}

/// What a bulk call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub affected: Vec<LeadId>,
    /// Ids accepted but left unchanged (e.g. already queued).
    pub skipped: Vec<LeadId>,
}

/// Caller-facing facade over the queue.
#[derive(Debug, Clone)]
pub struct BulkOperations {
    ctx: Arc<QueueContext>,
}

impl BulkOperations {
    pub fn new(ctx: Arc<QueueContext>) -> Self {
        Self { ctx }
    }

    /// All queue records of the caller's project, ordered by position.
    pub fn list(&self, caller: &Caller) -> QueueResult<Vec<QueueLead>> {
        self.ctx.store().get(caller.project_id)
    }

    /// Queue leads at the tail, in the given order, with a fresh attempt budget.
    ///
    /// Leads already queued or processing are skipped.
    pub fn enqueue(
        &self,
        caller: &Caller,
        lead_ids: &[LeadId],
        scheduled_date: Option<DateTime<Utc>>,
    ) -> QueueResult<BulkReport> {
        self.enqueue_at(caller, lead_ids, scheduled_date, Utc::now())
    }

    pub fn enqueue_at(
        &self,
        caller: &Caller,
        lead_ids: &[LeadId],
        scheduled_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QueueResult<BulkReport> {
        self.mutate(caller, AuditAction::BulkEnqueue, lead_ids, now, |snapshot, selected| {
            let mut tail = snapshot.iter().filter(|l| l.queue_status.is_active()).count() as u32;
            let mut report = BulkReport::default();
            let mut changed = Vec::new();

            for mut lead in selected {
                if lead.queue_status.is_active() {
                    report.skipped.push(lead.id);
                    continue;
                }
                lead.mark_enqueued(scheduled_date, now);
                tail += 1;
                lead.queue_position = Some(tail);
                report.affected.push(lead.id);
                changed.push(lead);
            }

            let metadata = json!({ "scheduledDate": scheduled_date, "skipped": report.skipped });
            Ok((changed, report, metadata))
        })
    }

    /// Return leads to `not_queued` from any state.
    ///
    /// An in-flight dispatch is not interrupted, but its outcome is ignored.
    pub fn remove(&self, caller: &Caller, lead_ids: &[LeadId]) -> QueueResult<BulkReport> {
        let now = Utc::now();
        self.mutate(caller, AuditAction::BulkRemove, lead_ids, now, |_snapshot, selected| {
            let mut report = BulkReport::default();
            let mut previous: HashMap<&'static str, usize> = HashMap::new();
            let mut changed = Vec::new();

            for mut lead in selected {
                *previous.entry(lead.queue_status.as_str()).or_default() += 1;
                lead.mark_removed(now);
                report.affected.push(lead.id);
                changed.push(lead);
            }

            Ok((changed, report, json!({ "previousStatus": previous })))
        })
    }

    /// Override the priority of queued or processing leads.
    ///
    /// Inactive leads and leads already at `priority` are reported as skipped.
    pub fn reprioritize(&self, caller: &Caller, lead_ids: &[LeadId], priority: Priority) -> QueueResult<BulkReport> {
        let now = Utc::now();
        self.mutate(caller, AuditAction::BulkReprioritize, lead_ids, now, |_snapshot, selected| {
            let mut report = BulkReport::default();
            let mut changed = Vec::new();

            for mut lead in selected {
                // Enqueueing re-derives priority, so an override only sticks on active leads.
                if !lead.queue_status.is_active() || lead.priority == priority {
                    report.skipped.push(lead.id);
                    continue;
                }
                lead.priority = priority;
                lead.updated_at = now;
                report.affected.push(lead.id);
                changed.push(lead);
            }

            let details = json!({ "priority": priority, "skipped": report.skipped });
            Ok((changed, report, details))
        })
    }

    /// Assign new positions to the project's whole active queue.
    ///
    /// `lead_ids` must name every queued or processing lead exactly once, and
    /// `new_positions` must be a permutation of `1..N`.
    pub fn reorder(&self, caller: &Caller, lead_ids: &[LeadId], new_positions: &[u32]) -> QueueResult<BulkReport> {
        if lead_ids.len() != new_positions.len() {
            return Err(QueueError::invalid_argument(format!(
                "reorder needs one position per lead ({} ids, {} positions)",
                lead_ids.len(),
                new_positions.len()
            )));
        }

        let now = Utc::now();
        self.mutate(caller, AuditAction::BulkReorder, lead_ids, now, |snapshot, selected| {
            let active = snapshot.iter().filter(|l| l.queue_status.is_active()).count();
            if let Some(inactive) = selected.iter().find(|l| !l.queue_status.is_active()) {
                return Err(QueueError::invalid_argument(format!(
                    "lead {} is {}, not in the queue",
                    inactive.id, inactive.queue_status
                )));
            }
            if selected.len() != active {
                return Err(QueueError::invalid_argument(format!(
                    "reorder must cover all {active} queued leads (got {})",
                    selected.len()
                )));
            }

            let mut seen = HashSet::new();
            for &pos in new_positions {
                if pos == 0 || pos as usize > active || !seen.insert(pos) {
                    return Err(QueueError::invalid_argument(format!(
                        "positions must be a permutation of 1..{active} (offending value {pos})"
                    )));
                }
            }

            let mut report = BulkReport::default();
            let mut changed = Vec::new();
            for (mut lead, &pos) in selected.into_iter().zip(new_positions) {
                if lead.queue_position == Some(pos) {
                    report.skipped.push(lead.id);
                } else {
                    report.affected.push(lead.id);
                }
                lead.queue_position = Some(pos);
                lead.updated_at = now;
                changed.push(lead);
            }

            Ok((changed, report, json!({ "positions": new_positions })))
        })
    }

    /// Register or refresh CRM facts for leads of the caller's project.
    ///
    /// Unknown leads are registered as `not_queued`; queue state of known leads
    /// is left untouched.
    pub fn sync_leads(&self, caller: &Caller, snapshots: &[LeadSnapshot]) -> QueueResult<BulkReport> {
        let project_id = caller.project_id;
        let state = self.ctx.project(project_id)?;
        let _writer = state.lock_writer()?;
        let now = Utc::now();

        let mut seen = HashSet::with_capacity(snapshots.len());
        let mut known = Vec::new();
        let mut fresh = Vec::new();
        for snapshot in snapshots {
            if !seen.insert(snapshot.id) {
                return Err(QueueError::invalid_argument(format!("lead {} listed twice", snapshot.id)));
            }
            if snapshot.project_id != project_id {
                return Err(QueueError::cross_project(snapshot.id, project_id));
            }
            match self.ctx.store().find(snapshot.id)? {
                Some(existing) if existing.project_id != project_id => {
                    return Err(QueueError::cross_project(snapshot.id, project_id));
                }
                Some(mut existing) => {
                    existing.refresh_from(snapshot, now);
                    known.push(existing);
                }
                None => fresh.push(QueueLead::from_snapshot(snapshot.clone(), now)),
            }
        }

        let report = BulkReport {
            affected: fresh.iter().chain(known.iter()).map(|l| l.id).collect(),
            skipped: Vec::new(),
        };
        let registered = fresh.len();
        let unknown_status: Vec<LeadId> = snapshots
            .iter()
            .filter(|s| s.status == LeadStatus::Unknown)
            .map(|s| s.id)
            .collect();
        for lead_id in &unknown_status {
            warn!(project_id = %project_id, lead_id = %lead_id, "lead synced with an unknown CRM status");
        }

        // Known ids belong to this project and cannot move while the writer
        // lock is held, so the insert is the only step that can reject the sync.
        self.ctx.store().insert_batch(project_id, fresh)?;
        self.ctx.store().upsert_batch(project_id, known)?;

        self.ctx.audit().append(AuditEntry::new(
            project_id,
            caller.actor,
            AuditAction::LeadSync,
            report.affected.clone(),
            json!({ "registered": registered, "unknownStatus": unknown_status }),
            now,
        ))?;

        info!(project_id = %project_id, count = report.affected.len(), registered, "leads synced");
        Ok(report)
    }

    /// Shared skeleton: lock, validate ids, compute, write once, audit once, wake.
    fn mutate<F>(
        &self,
        caller: &Caller,
        action: AuditAction,
        lead_ids: &[LeadId],
        now: DateTime<Utc>,
        apply: F,
    ) -> QueueResult<BulkReport>
    where
        F: FnOnce(&[QueueLead], Vec<QueueLead>) -> QueueResult<(Vec<QueueLead>, BulkReport, JsonValue)>,
    {
        let project_id = caller.project_id;
        let state = self.ctx.project(project_id)?;

        let report = {
            let _writer = state.lock_writer()?;

            let snapshot = self.ctx.store().get(project_id)?;
            let selected = self.resolve(project_id, &snapshot, lead_ids)?;
            let (changed, report, metadata) = apply(&snapshot, selected)?;

            self.ctx.store().upsert_batch(project_id, changed)?;
            self.ctx.audit().append(AuditEntry::new(
                project_id,
                caller.actor,
                action,
                lead_ids.to_vec(),
                metadata,
                now,
            ))?;
            report
        };

        info!(
            project_id = %project_id,
            action = action.as_str(),
            actor = %caller.actor,
            affected = report.affected.len(),
            skipped = report.skipped.len(),
            "bulk operation applied"
        );
        state.wake();
        Ok(report)
    }

    /// Look up every id in the project's snapshot, in request order.
    fn resolve(&self, project_id: ProjectId, snapshot: &[QueueLead], lead_ids: &[LeadId]) -> QueueResult<Vec<QueueLead>> {
        if lead_ids.is_empty() {
            return Err(QueueError::invalid_argument("no lead ids given"));
        }

        let by_id: HashMap<LeadId, &QueueLead> = snapshot.iter().map(|l| (l.id, l)).collect();
        let mut seen = HashSet::with_capacity(lead_ids.len());
        let mut selected = Vec::with_capacity(lead_ids.len());

        for id in lead_ids {
            if !seen.insert(*id) {
                return Err(QueueError::invalid_argument(format!("lead {id} listed twice")));
            }
            match by_id.get(id) {
                Some(lead) => selected.push((*lead).clone()),
                None => {
                    return Err(match self.ctx.store().find(*id)? {
                        Some(_) => QueueError::cross_project(*id, project_id),
                        None => QueueError::lead_not_found(*id),
                    });
                }
            }
        }

        Ok(selected)
    }
}
