//! Append-only audit trail of queue transitions and bulk operations.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use leadflow_core::{ActorId, LeadId, ProjectId, QueueError, QueueResult};

/// What was done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BulkEnqueue,
    BulkRemove,
    BulkReprioritize,
    BulkReorder,
    LeadSync,
    Promote,
    DispatchSuccess,
    DispatchFailure,
    /// An outcome arrived for a lead that had been removed meanwhile.
    DispatchIgnored,
    /// A queued lead already used more attempts than the current settings allow.
    RetryExhausted,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BulkEnqueue => "bulk_enqueue",
            Self::BulkRemove => "bulk_remove",
            Self::BulkReprioritize => "bulk_reprioritize",
            Self::BulkReorder => "bulk_reorder",
            Self::LeadSync => "lead_sync",
            Self::Promote => "promote",
            Self::DispatchSuccess => "dispatch_success",
            Self::DispatchFailure => "dispatch_failure",
            Self::DispatchIgnored => "dispatch_ignored",
            Self::RetryExhausted => "retry_exhausted",
        }
    }

    /// Outcome actions feed the metrics aggregator.
    pub fn is_dispatch_outcome(self) -> bool {
        matches!(self, Self::DispatchSuccess | Self::DispatchFailure)
    }
}

/// Who did it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Actor {
    /// Scheduler and dispatcher.
    System,
    Operator(ActorId),
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Operator(id) => write!(f, "operator:{id}"),
        }
    }
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    action: AuditAction,
    lead_ids: Vec<LeadId>,
    metadata: JsonValue,
    timestamp: DateTime<Utc>,
    actor: Actor,
    project_id: ProjectId,
}

impl AuditEntry {
    pub fn new(
        project_id: ProjectId,
        actor: Actor,
        action: AuditAction,
        lead_ids: Vec<LeadId>,
        metadata: JsonValue,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            action,
            lead_ids,
            metadata,
            timestamp,
            actor,
            project_id,
        }
    }

    pub fn action(&self) -> AuditAction {
        self.action
    }

    pub fn lead_ids(&self) -> &[LeadId] {
        &self.lead_ids
    }

    pub fn metadata(&self) -> &JsonValue {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }
}

/// External durable sink. Write-only; nothing reads back from it.
pub trait AuditSink: Send + Sync {
    fn write(&self, entry: &AuditEntry) -> QueueResult<()>;
}

/// Sink that emits each entry as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, entry: &AuditEntry) -> QueueResult<()> {
        tracing::info!(
            target: "leadflow_queue::audit",
            project_id = %entry.project_id,
            action = entry.action.as_str(),
            actor = %entry.actor,
            count = entry.lead_ids.len(),
            metadata = %entry.metadata,
            "audit"
        );
        Ok(())
    }
}

/// Append-only audit log.
pub trait AuditLogger: Send + Sync {
    fn append(&self, entry: AuditEntry) -> QueueResult<()>;

    /// Entries of a project with `timestamp >= since`, in append order.
    fn since(&self, project_id: ProjectId, since: DateTime<Utc>) -> QueueResult<Vec<AuditEntry>>;
}

impl<L> AuditLogger for Arc<L>
where
    L: AuditLogger + ?Sized,
{
    fn append(&self, entry: AuditEntry) -> QueueResult<()> {
        (**self).append(entry)
    }

    fn since(&self, project_id: ProjectId, since: DateTime<Utc>) -> QueueResult<Vec<AuditEntry>> {
        (**self).since(project_id, since)
    }
}

/// In-memory audit log that forwards every entry to the configured sinks.
///
/// Sink failures are logged and never fail the append; the in-memory log is the
/// record the queue reads from.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every entry of a project, in append order.
    pub fn entries(&self, project_id: ProjectId) -> QueueResult<Vec<AuditEntry>> {
        self.since(project_id, DateTime::<Utc>::MIN_UTC)
    }
}

impl core::fmt::Debug for InMemoryAuditLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryAuditLog")
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl AuditLogger for InMemoryAuditLog {
    fn append(&self, entry: AuditEntry) -> QueueResult<()> {
        for sink in &self.sinks {
            if let Err(err) = sink.write(&entry) {
                tracing::warn!(
                    project_id = %entry.project_id,
                    action = entry.action.as_str(),
                    error = %err,
                    "audit sink write failed"
                );
            }
        }

        self.entries
            .write()
            .map_err(|_| QueueError::storage("audit log lock poisoned"))?
            .push(entry);
        Ok(())
    }

    fn since(&self, project_id: ProjectId, since: DateTime<Utc>) -> QueueResult<Vec<AuditEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| QueueError::storage("audit log lock poisoned"))?;

        Ok(entries
            .iter()
            .filter(|e| e.project_id == project_id && e.timestamp >= since)
            .cloned()
            .collect())
    }
}
