//! Shared queue state: store, audit log and per-project coordination.
//!
//! All mutations of one project go through its writer lock. The lock is never
//! held across an await; dispatch calls run outside it. A separate in-flight
//! flag keeps ticks of the same project from overlapping. Projects never share
//! a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::Notify;

use leadflow_core::{ProjectId, QueueError, QueueResult};

use crate::audit::AuditLogger;
use crate::scheduler::WeightedCursor;
use crate::settings::{QueueSettings, ValidatedSettings};
use crate::store::QueueRecordStore;

/// Coordination state of one project.
#[derive(Debug, Default)]
pub struct ProjectState {
    settings: RwLock<Option<ValidatedSettings>>,
    /// Single-writer lock; also guards the scheduler's round-robin credit.
    writer: Mutex<WeightedCursor>,
    ticking: AtomicBool,
    wake: Notify,
}

impl ProjectState {
    pub fn lock_writer(&self) -> QueueResult<MutexGuard<'_, WeightedCursor>> {
        self.writer
            .lock()
            .map_err(|_| QueueError::storage("project writer lock poisoned"))
    }

    /// Claim the tick slot. `None` while another tick is in flight.
    pub fn try_begin_tick(self: &Arc<Self>) -> Option<TickGuard> {
        self.ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard {
                state: Arc::clone(self),
            })
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::Acquire)
    }

    /// Ask the project's worker for an early tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn woken(&self) {
        self.wake.notified().await
    }
}

/// Releases the tick slot on drop.
#[derive(Debug)]
pub struct TickGuard {
    state: Arc<ProjectState>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.state.ticking.store(false, Ordering::Release);
    }
}

fn registry_poisoned<T>(_: T) -> QueueError {
    QueueError::storage("project registry lock poisoned")
}

/// Everything the scheduler, dispatcher, metrics and bulk operations share.
pub struct QueueContext {
    store: Arc<dyn QueueRecordStore>,
    audit: Arc<dyn AuditLogger>,
    projects: RwLock<HashMap<ProjectId, Arc<ProjectState>>>,
}

impl QueueContext {
    pub fn new(store: Arc<dyn QueueRecordStore>, audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            store,
            audit,
            projects: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &dyn QueueRecordStore {
        self.store.as_ref()
    }

    pub fn audit(&self) -> &dyn AuditLogger {
        self.audit.as_ref()
    }

    /// Coordination state of a project, created on first use.
    pub fn project(&self, project_id: ProjectId) -> QueueResult<Arc<ProjectState>> {
        if let Some(state) = self.projects.read().map_err(registry_poisoned)?.get(&project_id) {
            return Ok(Arc::clone(state));
        }

        let mut projects = self.projects.write().map_err(registry_poisoned)?;
        Ok(Arc::clone(projects.entry(project_id).or_default()))
    }

    /// Validate and install a project's settings. Invalid settings leave the
    /// previous ones in place.
    pub fn configure(&self, project_id: ProjectId, settings: &QueueSettings) -> QueueResult<ValidatedSettings> {
        let validated = settings.validate().inspect_err(|err| {
            tracing::warn!(project_id = %project_id, error = %err, "rejected queue settings");
        })?;

        let state = self.project(project_id)?;
        *state
            .settings
            .write()
            .map_err(|_| QueueError::storage("settings lock poisoned"))? = Some(validated.clone());

        tracing::info!(
            project_id = %project_id,
            max_concurrent = validated.max_concurrent_processing(),
            retry_attempts = validated.retry_attempts(),
            "queue settings applied"
        );
        Ok(validated)
    }

    /// Current settings of a project; `NotFound` until `configure` succeeded.
    pub fn settings(&self, project_id: ProjectId) -> QueueResult<ValidatedSettings> {
        let state = self.project(project_id)?;
        let settings = state
            .settings
            .read()
            .map_err(|_| QueueError::storage("settings lock poisoned"))?;
        settings
            .clone()
            .ok_or_else(|| QueueError::project_not_configured(project_id))
    }
}

impl core::fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueContext").finish_non_exhaustive()
    }
}
