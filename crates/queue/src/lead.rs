//! Queue projection of a CRM lead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use leadflow_core::{Entity, LeadId, ProjectId};

/// CRM lifecycle stage. Informational only; the queue never mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Lost,
    /// A stage this build does not know about.
    Unknown,
}

impl<'de> Deserialize<'de> for LeadStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl LeadStatus {
    /// Parse a CRM stage label.
    ///
    /// Unrecognised labels become `Unknown` and are logged, never coerced to `New`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "contacted" => Self::Contacted,
            "qualified" => Self::Qualified,
            "converted" => Self::Converted,
            "lost" => Self::Lost,
            "unknown" => Self::Unknown,
            _ => {
                tracing::warn!(status = raw, "unknown lead status from CRM");
                Self::Unknown
            }
        }
    }
}

/// Queue state, owned exclusively by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    NotQueued,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    /// Queued and processing leads occupy a queue position.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotQueued => "not_queued",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Tiers from highest to lowest.
    pub const DESCENDING: [Priority; 4] = [Self::Urgent, Self::High, Self::Medium, Self::Low];

    /// Derive the tier from a heat score (>8 urgent, >6 high, >4 medium, else low).
    pub fn from_heat_score(score: f64) -> Self {
        if score > 8.0 {
            Self::Urgent
        } else if score > 6.0 {
            Self::High
        } else if score > 4.0 {
            Self::Medium
        } else {
            // NaN lands here as well.
            Self::Low
        }
    }
}

/// Normalised CRM facts consumed at the store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSnapshot {
    pub id: LeadId,
    pub project_id: ProjectId,
    pub status: LeadStatus,
    pub heat_score: f64,
}

/// The queue-relevant projection of a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLead {
    pub id: LeadId,
    pub project_id: ProjectId,
    pub status: LeadStatus,
    pub heat_score: f64,
    pub queue_status: QueueStatus,
    pub priority: Priority,
    /// Not eligible for dispatch before this instant.
    pub scheduled_date: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Dense `1..N` over the project's active leads; `None` otherwise.
    pub queue_position: Option<u32>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl QueueLead {
    /// A lead known to the queue but not enqueued.
    pub fn from_snapshot(snapshot: LeadSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: snapshot.id,
            project_id: snapshot.project_id,
            status: snapshot.status,
            heat_score: snapshot.heat_score,
            queue_status: QueueStatus::NotQueued,
            priority: Priority::from_heat_score(snapshot.heat_score),
            scheduled_date: None,
            attempts: 0,
            queue_position: None,
            enqueued_at: None,
            processing_started_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Refresh CRM facts without touching queue state.
    pub fn refresh_from(&mut self, snapshot: &LeadSnapshot, now: DateTime<Utc>) {
        self.status = snapshot.status;
        self.heat_score = snapshot.heat_score;
        self.updated_at = now;
    }

    /// Eligible for selection at `now` (queued and not waiting on a schedule).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.queue_status == QueueStatus::Queued && self.scheduled_date.is_none_or(|at| at <= now)
    }

    /// Another send stays within `1 + retry_attempts` total attempts.
    pub fn has_attempts_left(&self, retry_attempts: u32) -> bool {
        self.attempts <= retry_attempts
    }

    /// Put the lead (back) in the queue with a fresh attempt budget.
    ///
    /// The position is left unset; the store appends it at the tail.
    pub fn mark_enqueued(&mut self, scheduled_date: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::Queued;
        self.priority = Priority::from_heat_score(self.heat_score);
        self.scheduled_date = scheduled_date;
        self.attempts = 0;
        self.queue_position = None;
        self.enqueued_at = Some(now);
        self.processing_started_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_removed(&mut self, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::NotQueued;
        self.scheduled_date = None;
        self.queue_position = None;
        self.processing_started_at = None;
        self.updated_at = now;
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::Processing;
        self.attempts += 1;
        self.processing_started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::Completed;
        self.scheduled_date = None;
        self.last_error = None;
        self.processing_started_at = None;
        self.updated_at = now;
    }

    /// Return to `queued`, waiting until `retry_at`. Keeps its queue position.
    pub fn mark_retry_wait(&mut self, error: String, retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::Queued;
        self.scheduled_date = Some(retry_at);
        self.last_error = Some(error);
        self.processing_started_at = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::Failed;
        self.scheduled_date = None;
        self.last_error = Some(error);
        self.processing_started_at = None;
        self.updated_at = now;
    }
}

impl Entity for QueueLead {
    type Id = LeadId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn project_id(&self) -> ProjectId {
        self.project_id
    }
}
