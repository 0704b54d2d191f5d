//! Selection of the next leads to dispatch.
//!
//! Selection is synchronous and works on one snapshot of a project's leads:
//!
//! 1. capacity = `maxConcurrentProcessing` minus leads already processing
//! 2. nothing is selected outside the dispatch window
//! 3. due leads (queued, schedule reached, attempts left) are partitioned by
//!    priority
//! 4. tiers are drawn by smooth weighted round-robin; FIFO by queue position
//!    inside a tier
//!
//! The round-robin credit lives in a `WeightedCursor` that the caller keeps per
//! project, so proportions hold across ticks even when capacity is 1.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use leadflow_core::LeadId;

use crate::lead::{Priority, QueueLead, QueueStatus};
use crate::settings::ValidatedSettings;

/// Round-robin credit per priority tier (indexed like `Priority::DESCENDING`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WeightedCursor {
    credit: [i64; 4],
}

impl WeightedCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next tier among the non-empty ones.
    ///
    /// Every candidate tier earns its weight; the richest wins and pays the sum
    /// of candidate weights. Equal credit goes to the higher priority.
    fn next_tier(&mut self, settings: &ValidatedSettings, non_empty: [bool; 4]) -> Option<usize> {
        let mut total = 0i64;
        let mut best: Option<usize> = None;

        for (slot, priority) in Priority::DESCENDING.iter().enumerate() {
            if !non_empty[slot] {
                // Stale credit would let a refilled tier burst ahead.
                self.credit[slot] = 0;
                continue;
            }
            let weight = i64::from(settings.weight(*priority));
            self.credit[slot] += weight;
            total += weight;
            if best.is_none_or(|b| self.credit[slot] > self.credit[b]) {
                best = Some(slot);
            }
        }

        let picked = best?;
        self.credit[picked] -= total;
        Some(picked)
    }
}

/// Result of one selection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Leads to promote, in draw order.
    pub lead_ids: Vec<LeadId>,
    /// Free processing slots at selection time.
    pub capacity: usize,
    /// Leads that were due.
    pub eligible: usize,
    /// Selection was skipped because the dispatch window is closed.
    pub window_closed: bool,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.lead_ids.is_empty()
    }
}

/// Stateless selector; state lives in the caller's `WeightedCursor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Scheduler;

impl Scheduler {
    /// Choose up to the free capacity of leads to move from `queued` to `processing`.
    pub fn select(
        snapshot: &[QueueLead],
        settings: &ValidatedSettings,
        cursor: &mut WeightedCursor,
        now: DateTime<Utc>,
    ) -> Selection {
        let processing = snapshot
            .iter()
            .filter(|l| l.queue_status == QueueStatus::Processing)
            .count();
        let capacity = (settings.max_concurrent_processing() as usize).saturating_sub(processing);

        if !settings.is_dispatch_window(now) {
            return Selection {
                capacity,
                window_closed: true,
                ..Selection::default()
            };
        }

        let mut tiers: [VecDeque<&QueueLead>; 4] = Default::default();
        let retry_attempts = settings.retry_attempts();
        for lead in snapshot
            .iter()
            .filter(|l| l.is_due(now) && l.has_attempts_left(retry_attempts))
        {
            let slot = Priority::DESCENDING
                .iter()
                .position(|p| *p == lead.priority)
                .unwrap_or(Priority::DESCENDING.len() - 1);
            tiers[slot].push_back(lead);
        }
        for tier in tiers.iter_mut() {
            tier.make_contiguous()
                .sort_by_key(|l| (l.queue_position.unwrap_or(u32::MAX), l.id));
        }
        let eligible = tiers.iter().map(VecDeque::len).sum();

        let mut lead_ids = Vec::with_capacity(capacity.min(eligible));
        while lead_ids.len() < capacity {
            let non_empty = [0, 1, 2, 3].map(|slot| !tiers[slot].is_empty());
            let Some(slot) = cursor.next_tier(settings, non_empty) else {
                break;
            };
            if let Some(lead) = tiers[slot].pop_front() {
                lead_ids.push(lead.id);
            }
        }

        Selection {
            lead_ids,
            capacity,
            eligible,
            window_closed: false,
        }
    }

    /// Queued leads whose attempts already exceed the retry budget.
    ///
    /// Happens when `retryAttempts` is lowered while leads wait for a retry.
    /// They are failed without another send.
    pub fn exhausted(snapshot: &[QueueLead], settings: &ValidatedSettings, now: DateTime<Utc>) -> Vec<QueueLead> {
        let retry_attempts = settings.retry_attempts();
        snapshot
            .iter()
            .filter(|l| l.queue_status == QueueStatus::Queued && !l.has_attempts_left(retry_attempts))
            .map(|lead| {
                let mut lead = lead.clone();
                lead.mark_failed(format!("retry budget of {retry_attempts} exhausted"), now);
                lead
            })
            .collect()
    }

    /// Apply the promotion to the selected leads of a snapshot.
    ///
    /// Returns the updated records; the caller persists them in one batch.
    pub fn promote(snapshot: &[QueueLead], selection: &Selection, now: DateTime<Utc>) -> Vec<QueueLead> {
        selection
            .lead_ids
            .iter()
            .filter_map(|id| snapshot.iter().find(|l| l.id == *id))
            .map(|lead| {
                let mut lead = lead.clone();
                lead.mark_processing(now);
                lead
            })
            .collect()
    }
}
