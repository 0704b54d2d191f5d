use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use proptest::prelude::*;

use leadflow_core::{LeadId, ProjectId};
use leadflow_queue::{
    Actor, Caller, InMemoryAuditLog, InMemoryQueueStore, LeadQueue, LeadSnapshot, LeadStatus, MessageGateway,
    QueueLead, QueueRecordStore, QueueSettings, QueueStatus, RuntimeConfig, SendOutcome, WorkingHours,
};

/// Records the highest number of processing leads seen while sending.
struct CapacityWatch {
    store: Arc<InMemoryQueueStore>,
    project: ProjectId,
    outcomes: Vec<bool>,
    calls: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl MessageGateway for CapacityWatch {
    async fn send(&self, _lead: &QueueLead) -> SendOutcome {
        let processing = self
            .store
            .get(self.project)
            .unwrap()
            .iter()
            .filter(|l| l.queue_status == QueueStatus::Processing)
            .count();
        self.peak.fetch_max(processing, Ordering::SeqCst);

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outcomes[call % self.outcomes.len()] {
            SendOutcome::Success
        } else {
            SendOutcome::Failure("scripted".into())
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Enqueue(Vec<usize>),
    Remove(Vec<usize>),
    Tick,
}

fn op(leads: usize) -> impl Strategy<Value = Op> {
    let ids = prop::collection::hash_set(0..leads, 1..4).prop_map(|set| set.into_iter().collect::<Vec<_>>());
    prop_oneof![
        ids.clone().prop_map(Op::Enqueue),
        ids.prop_map(Op::Remove),
        Just(Op::Tick),
        Just(Op::Tick),
    ]
}

fn settings(max_concurrent: i64) -> QueueSettings {
    QueueSettings {
        max_concurrent_processing: max_concurrent,
        retry_attempts: 2,
        retry_delay_minutes: 1,
        enable_weekends: true,
        working_hours: WorkingHours {
            start: "00:00".into(),
            end: "00:00".into(),
            timezone: "UTC".into(),
        },
        ..QueueSettings::default()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn assert_dense(leads: &[QueueLead]) {
    let mut positions: Vec<u32> = leads.iter().filter_map(|l| l.queue_position).collect();
    positions.sort_unstable();
    let active = leads.iter().filter(|l| l.queue_status.is_active()).count();

    assert_eq!(positions, (1..=active as u32).collect::<Vec<_>>());
    assert!(
        leads
            .iter()
            .all(|l| l.queue_status.is_active() == l.queue_position.is_some())
    );
}

fn register(queue: &LeadQueue, caller: &Caller, n: usize, scores: &[f64]) -> Vec<LeadId> {
    let snapshots: Vec<_> = (0..n)
        .map(|i| LeadSnapshot {
            id: LeadId::new(),
            project_id: caller.project_id,
            status: LeadStatus::New,
            heat_score: scores[i % scores.len()],
        })
        .collect();
    queue.bulk().sync_leads(caller, &snapshots).unwrap();
    snapshots.into_iter().map(|s| s.id).collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Processing never exceeds the cap and positions stay dense, whatever the
    /// interleaving of bulk operations and ticks.
    #[test]
    fn cap_and_dense_positions_hold(
        max_concurrent in 1i64..4,
        scores in prop::collection::vec(0.0f64..10.0, 1..6),
        outcomes in prop::collection::vec(any::<bool>(), 1..5),
        ops in prop::collection::vec(op(8), 1..30),
    ) {
        let store = InMemoryQueueStore::arc();
        let project = ProjectId::new();
        let watch = Arc::new(CapacityWatch {
            store: Arc::clone(&store),
            project,
            outcomes,
            calls: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = LeadQueue::new(store.clone(), InMemoryAuditLog::arc(), watch.clone(), RuntimeConfig::default());
        queue.configure(project, &settings(max_concurrent)).unwrap();
        let caller = Caller::new(project, Actor::System);
        let ids = register(&queue, &caller, 8, &scores);

        let rt = runtime();
        let mut now: DateTime<Utc> = DateTime::parse_from_rfc3339("2026-10-14T10:00:00Z").unwrap().with_timezone(&Utc);

        for op in ops {
            match op {
                Op::Enqueue(idx) => {
                    let batch: Vec<_> = idx.iter().map(|i| ids[*i]).collect();
                    queue.bulk().enqueue(&caller, &batch, None).unwrap();
                }
                Op::Remove(idx) => {
                    let batch: Vec<_> = idx.iter().map(|i| ids[*i]).collect();
                    queue.bulk().remove(&caller, &batch).unwrap();
                }
                Op::Tick => {
                    rt.block_on(queue.tick_at(project, now)).unwrap();
                    now += ChronoDuration::minutes(2);
                }
            }

            let leads = store.get(project).unwrap();
            let processing = leads.iter().filter(|l| l.queue_status == QueueStatus::Processing).count();
            prop_assert!(processing <= max_concurrent as usize);
            assert_dense(&leads);
        }

        prop_assert!(watch.peak.load(Ordering::SeqCst) <= max_concurrent as usize);
    }

    /// Applying the same permutation twice yields the same dense assignment.
    #[test]
    fn reorder_is_idempotent(
        positions in (1usize..8).prop_flat_map(|n| Just((1..=n as u32).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let store = InMemoryQueueStore::arc();
        let project = ProjectId::new();
        let watch = Arc::new(CapacityWatch {
            store: Arc::clone(&store),
            project,
            outcomes: vec![true],
            calls: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = LeadQueue::new(store.clone(), InMemoryAuditLog::arc(), watch, RuntimeConfig::default());
        queue.configure(project, &settings(1)).unwrap();
        let caller = Caller::new(project, Actor::System);
        let ids = register(&queue, &caller, positions.len(), &[5.0]);
        queue.bulk().enqueue(&caller, &ids, None).unwrap();

        queue.bulk().reorder(&caller, &ids, &positions).unwrap();
        let once: Vec<_> = ids.iter().map(|id| store.find(*id).unwrap().unwrap().queue_position).collect();
        queue.bulk().reorder(&caller, &ids, &positions).unwrap();
        let twice: Vec<_> = ids.iter().map(|id| store.find(*id).unwrap().unwrap().queue_position).collect();

        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once, positions.iter().map(|p| Some(*p)).collect::<Vec<_>>());
        assert_dense(&store.get(project).unwrap());
    }
}
