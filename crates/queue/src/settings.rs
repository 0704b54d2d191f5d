//! Per-project queue settings and their validation.
//!
//! `QueueSettings` is the shape supplied by the external settings store. It is
//! validated once at the boundary into `ValidatedSettings`, which is what the
//! scheduler, retry policy and dispatcher are handed.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use leadflow_core::{QueueError, QueueResult};

use crate::lead::Priority;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every retry waits `retryDelayMinutes`.
    #[default]
    Fixed,
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

/// Time-of-day window during which automated dispatch is permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingHours {
    /// `HH:MM`, local to `timezone`.
    pub start: String,
    /// `HH:MM`, local to `timezone`. Equal to `start` means open all day.
    pub end: String,
    /// `UTC`, `Z` or a fixed offset such as `-03:00`.
    pub timezone: String,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start: "09:00".to_string(),
            end: "18:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Relative dispatch weight per priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub urgent: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            urgent: 4,
            high: 3,
            medium: 2,
            low: 1,
        }
    }
}

/// Queue settings as supplied by the external settings UI/store.
///
/// Numeric fields are signed so out-of-range input can be rejected rather than
/// failing to deserialize or being clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    pub max_concurrent_processing: i64,
    pub retry_attempts: i64,
    pub retry_delay_minutes: i64,
    #[serde(default)]
    pub retry_backoff: BackoffStrategy,
    pub working_hours: WorkingHours,
    pub enable_weekends: bool,
    pub priority_weights: PriorityWeights,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent_processing: 3,
            retry_attempts: 2,
            retry_delay_minutes: 30,
            retry_backoff: BackoffStrategy::Fixed,
            working_hours: WorkingHours::default(),
            enable_weekends: false,
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl QueueSettings {
    /// Validate against documented bounds. Fails fast on the first violation.
    pub fn validate(&self) -> QueueResult<ValidatedSettings> {
        if self.max_concurrent_processing < 1 {
            return Err(QueueError::configuration(format!(
                "maxConcurrentProcessing must be >= 1 (got {})",
                self.max_concurrent_processing
            )));
        }
        if self.retry_attempts < 0 {
            return Err(QueueError::configuration(format!(
                "retryAttempts must be >= 0 (got {})",
                self.retry_attempts
            )));
        }
        if self.retry_delay_minutes <= 0 {
            return Err(QueueError::configuration(format!(
                "retryDelayMinutes must be > 0 (got {})",
                self.retry_delay_minutes
            )));
        }

        let max_concurrent = to_u32("maxConcurrentProcessing", self.max_concurrent_processing)?;
        let retry_attempts = to_u32("retryAttempts", self.retry_attempts)?;
        let retry_delay = Duration::try_minutes(self.retry_delay_minutes)
            .ok_or_else(|| QueueError::configuration("retryDelayMinutes is out of range"))?;

        let w = self.priority_weights;
        let mut weights = [0u32; 4];
        for (slot, (name, value)) in weights.iter_mut().zip([
            ("urgent", w.urgent),
            ("high", w.high),
            ("medium", w.medium),
            ("low", w.low),
        ]) {
            if value <= 0 {
                return Err(QueueError::configuration(format!(
                    "priorityWeights.{name} must be > 0 (got {value})"
                )));
            }
            *slot = to_u32("priorityWeights", value)?;
        }

        let start = parse_time("workingHours.start", &self.working_hours.start)?;
        let end = parse_time("workingHours.end", &self.working_hours.end)?;
        let offset = parse_offset(&self.working_hours.timezone)?;

        Ok(ValidatedSettings {
            max_concurrent,
            retry_attempts,
            retry_delay,
            backoff: self.retry_backoff,
            window_start: start,
            window_end: end,
            offset,
            enable_weekends: self.enable_weekends,
            weights,
        })
    }
}

fn to_u32(field: &str, value: i64) -> QueueResult<u32> {
    u32::try_from(value).map_err(|_| QueueError::configuration(format!("{field} is out of range (got {value})")))
}

fn parse_time(field: &str, raw: &str) -> QueueResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| QueueError::configuration(format!("{field} must be HH:MM (got {raw:?}): {e}")))
}

/// Parse `UTC`, `Z` or `±HH:MM` into a fixed offset.
fn parse_offset(raw: &str) -> QueueResult<FixedOffset> {
    let tz = raw.trim();
    let invalid = || QueueError::configuration(format!("workingHours.timezone must be UTC or ±HH:MM (got {raw:?})"));

    if tz.eq_ignore_ascii_case("utc") || tz.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (h, m) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = h.parse().map_err(|_| invalid())?;
    let minutes: i32 = m.parse().map_err(|_| invalid())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Settings that passed validation. Cheap to clone and pass by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSettings {
    max_concurrent: u32,
    retry_attempts: u32,
    retry_delay: Duration,
    backoff: BackoffStrategy,
    window_start: NaiveTime,
    window_end: NaiveTime,
    offset: FixedOffset,
    enable_weekends: bool,
    /// Indexed by `weight_slot`.
    weights: [u32; 4],
}

impl ValidatedSettings {
    pub fn max_concurrent_processing(&self) -> u32 {
        self.max_concurrent
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn backoff(&self) -> BackoffStrategy {
        self.backoff
    }

    pub fn weight(&self, priority: Priority) -> u32 {
        self.weights[weight_slot(priority)]
    }

    /// Whether automated dispatch may run at `now`.
    ///
    /// Weekends (local time) are governed solely by `enableWeekends`; weekdays by
    /// the working-hours window, which may wrap midnight.
    pub fn is_dispatch_window(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return self.enable_weekends;
        }

        let t = local.time();
        let (start, end) = (self.window_start, self.window_end);
        if start == end {
            true
        } else if start < end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }

    /// Midnight of the local day containing `now`, as a UTC instant.
    pub fn start_of_local_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.offset).date_naive();
        let midnight = local_date.and_time(NaiveTime::MIN);
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now)
    }
}

fn weight_slot(priority: Priority) -> usize {
    match priority {
        Priority::Urgent => 0,
        Priority::High => 1,
        Priority::Medium => 2,
        Priority::Low => 3,
    }
}
