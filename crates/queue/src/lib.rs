//! Lead automation queue: storage, scheduling, dispatch, retries, audit and
//! metrics for per-project outreach queues.

pub mod audit;
pub mod bulk;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod lead;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod worker;

pub use audit::{Actor, AuditAction, AuditEntry, AuditLogger, AuditSink, InMemoryAuditLog, TracingAuditSink};
pub use bulk::{BulkOperations, BulkReport, Caller};
pub use config::RuntimeConfig;
pub use dispatcher::{MessageGateway, SendOutcome};
pub use engine::{LeadQueue, TickReport, TickSummary};
pub use lead::{LeadSnapshot, LeadStatus, Priority, QueueLead, QueueStatus};
pub use metrics::{MetricsAggregator, MetricsRefresher, QueueMetrics};
pub use retry::{RetryDecision, RetryPolicy};
pub use settings::{BackoffStrategy, PriorityWeights, QueueSettings, ValidatedSettings, WorkingHours};
pub use store::{InMemoryQueueStore, QueueRecordStore};
pub use worker::{QueueWorker, QueueWorkerHandle};
