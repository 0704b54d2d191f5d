//! Queue record storage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use leadflow_core::{Entity, LeadId, ProjectId, QueueError, QueueResult};

use crate::lead::{QueueLead, QueueStatus};

/// Store of queue projections, keyed by lead.
///
/// Every mutation renumbers the affected project's active leads (queued and
/// processing) to a dense `1..N` in the same critical section. Leads entering the
/// active set without a position are appended at the tail; leads leaving it lose
/// their position.
pub trait QueueRecordStore: Send + Sync {
    /// Register a lead the store has never seen.
    fn insert(&self, lead: QueueLead) -> QueueResult<()>;

    /// Register several new leads of one project atomically. Fails without
    /// writing anything if any id is already known or listed twice.
    fn insert_batch(&self, project_id: ProjectId, leads: Vec<QueueLead>) -> QueueResult<()>;

    /// All leads of a project, ordered by queue position (unpositioned last).
    fn get(&self, project_id: ProjectId) -> QueueResult<Vec<QueueLead>>;

    /// Look up a single lead.
    fn find(&self, lead_id: LeadId) -> QueueResult<Option<QueueLead>>;

    /// Replace an existing lead. Unknown ids fail with `NotFound`.
    fn upsert(&self, lead: QueueLead) -> QueueResult<()>;

    /// Change only the queue status of an existing lead.
    fn set_status(&self, lead_id: LeadId, status: QueueStatus) -> QueueResult<()>;

    /// Replace several leads of one project atomically: either every record is
    /// written (and the project renumbered once) or none is.
    fn upsert_batch(&self, project_id: ProjectId, leads: Vec<QueueLead>) -> QueueResult<()>;
}

impl<S> QueueRecordStore for Arc<S>
where
    S: QueueRecordStore + ?Sized,
{
    fn insert(&self, lead: QueueLead) -> QueueResult<()> {
        (**self).insert(lead)
    }

    fn insert_batch(&self, project_id: ProjectId, leads: Vec<QueueLead>) -> QueueResult<()> {
        (**self).insert_batch(project_id, leads)
    }

    fn get(&self, project_id: ProjectId) -> QueueResult<Vec<QueueLead>> {
        (**self).get(project_id)
    }

    fn find(&self, lead_id: LeadId) -> QueueResult<Option<QueueLead>> {
        (**self).find(lead_id)
    }

    fn upsert(&self, lead: QueueLead) -> QueueResult<()> {
        (**self).upsert(lead)
    }

    fn set_status(&self, lead_id: LeadId, status: QueueStatus) -> QueueResult<()> {
        (**self).set_status(lead_id, status)
    }

    fn upsert_batch(&self, project_id: ProjectId, leads: Vec<QueueLead>) -> QueueResult<()> {
        (**self).upsert_batch(project_id, leads)
    }
}

/// In-memory queue store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    leads: RwLock<HashMap<LeadId, QueueLead>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::storage("queue store lock poisoned")
}

/// Reassign dense positions to a project's active leads, preserving the
/// existing relative order and appending unpositioned leads in arrival order.
fn renumber(leads: &mut HashMap<LeadId, QueueLead>, project_id: ProjectId) {
    let mut active: Vec<&mut QueueLead> = leads
        .values_mut()
        .filter(|l| l.project_id == project_id)
        .filter_map(|l| {
            if l.queue_status.is_active() {
                Some(l)
            } else {
                l.queue_position = None;
                None
            }
        })
        .collect();

    active.sort_by_key(|l| (l.queue_position.unwrap_or(u32::MAX), l.enqueued_at, l.id));

    for (idx, lead) in active.into_iter().enumerate() {
        lead.queue_position = Some(idx as u32 + 1);
    }
}

fn check_existing(
    leads: &HashMap<LeadId, QueueLead>,
    lead: &QueueLead,
) -> QueueResult<()> {
    match leads.get(&lead.id) {
        None => Err(QueueError::lead_not_found(lead.id)),
        Some(existing) if existing.project_id() != lead.project_id() => {
            Err(QueueError::cross_project(lead.id, lead.project_id()))
        }
        Some(_) => Ok(()),
    }
}

impl QueueRecordStore for InMemoryQueueStore {
    fn insert(&self, lead: QueueLead) -> QueueResult<()> {
        let mut leads = self.leads.write().map_err(poisoned)?;
        if leads.contains_key(&lead.id) {
            return Err(QueueError::invalid_argument(format!("lead {} already registered", lead.id)));
        }
        let project_id = lead.project_id;
        leads.insert(lead.id, lead);
        renumber(&mut leads, project_id);
        Ok(())
    }

    fn insert_batch(&self, project_id: ProjectId, batch: Vec<QueueLead>) -> QueueResult<()> {
        let mut leads = self.leads.write().map_err(poisoned)?;

        let mut seen = HashSet::with_capacity(batch.len());
        for lead in &batch {
            if lead.project_id != project_id {
                return Err(QueueError::cross_project(lead.id, project_id));
            }
            match leads.get(&lead.id) {
                Some(existing) if existing.project_id() != project_id => {
                    return Err(QueueError::cross_project(lead.id, project_id));
                }
                Some(_) => {
                    return Err(QueueError::invalid_argument(format!("lead {} already registered", lead.id)));
                }
                None if !seen.insert(lead.id) => {
                    return Err(QueueError::invalid_argument(format!("lead {} listed twice", lead.id)));
                }
                None => {}
            }
        }

        for lead in batch {
            leads.insert(lead.id, lead);
        }
        renumber(&mut leads, project_id);
        Ok(())
    }

    fn get(&self, project_id: ProjectId) -> QueueResult<Vec<QueueLead>> {
        let leads = self.leads.read().map_err(poisoned)?;
        let mut result: Vec<_> = leads
            .values()
            .filter(|l| l.project_id == project_id)
            .cloned()
            .collect();

        result.sort_by_key(|l| (l.queue_position.unwrap_or(u32::MAX), l.id));
        Ok(result)
    }

    fn find(&self, lead_id: LeadId) -> QueueResult<Option<QueueLead>> {
        let leads = self.leads.read().map_err(poisoned)?;
        Ok(leads.get(&lead_id).cloned())
    }

    fn upsert(&self, lead: QueueLead) -> QueueResult<()> {
        let mut leads = self.leads.write().map_err(poisoned)?;
        check_existing(&leads, &lead)?;
        let project_id = lead.project_id;
        leads.insert(lead.id, lead);
        renumber(&mut leads, project_id);
        Ok(())
    }

    fn set_status(&self, lead_id: LeadId, status: QueueStatus) -> QueueResult<()> {
        let mut leads = self.leads.write().map_err(poisoned)?;
        let lead = leads
            .get_mut(&lead_id)
            .ok_or_else(|| QueueError::lead_not_found(lead_id))?;
        lead.queue_status = status;
        let project_id = lead.project_id;
        renumber(&mut leads, project_id);
        Ok(())
    }

    fn upsert_batch(&self, project_id: ProjectId, batch: Vec<QueueLead>) -> QueueResult<()> {
        let mut leads = self.leads.write().map_err(poisoned)?;

        // Validate everything before touching anything.
        for lead in &batch {
            if lead.project_id != project_id {
                return Err(QueueError::cross_project(lead.id, project_id));
            }
            check_existing(&leads, lead)?;
        }

        for lead in batch {
            leads.insert(lead.id, lead);
        }
        renumber(&mut leads, project_id);
        Ok(())
    }
}
