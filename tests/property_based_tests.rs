//! Property-based tests for cursor handling in the runner and cycle state.

mod common;

use chrono::Utc;
use common::*;
use cycle_orchestrator::config::WorkerConfig;
use cycle_orchestrator::state::{CycleState, ModuleUpdate};
use cycle_orchestrator::worker::{Worker, WorkerRunner};
use cycle_orchestrator::ItemId;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

proptest! {
    #[test]
    fn fetched_ids_are_after_cursor_and_ascending(
        items in proptest::collection::vec(0i64..1_000, 0..60),
        cursor in proptest::option::of(0i64..1_000),
        limit in 1usize..25,
    ) {
        let worker = ScriptedWorker::new("maps", items);
        let batch = tokio_test::block_on(worker.get_items_to_process(limit, cursor)).unwrap();

        prop_assert!(batch.len() <= limit);
        prop_assert!(batch.windows(2).all(|w| w[0] < w[1]));
        if let Some(cursor) = cursor {
            prop_assert!(batch.iter().all(|id| *id > cursor));
        }
    }

    #[test]
    fn runner_attempts_every_item_after_cursor_once_in_order(
        items in proptest::collection::btree_set(0i64..500, 0..40),
        cursor in proptest::option::of(0i64..500),
        batch_size in 1usize..8,
    ) {
        let worker = Arc::new(ScriptedWorker::new("yelp", items.iter().copied()));
        let runner = WorkerRunner::new(
            worker.clone(),
            WorkerConfig { batch_size, delay_between_items_ms: 0 },
        );
        let stats = tokio_test::block_on(runner.run(cursor, &RecordingObserver::default())).unwrap();

        let expected: Vec<ItemId> = items
            .iter()
            .copied()
            .filter(|id| cursor.map_or(true, |c| *id > c))
            .collect();
        prop_assert_eq!(worker.attempted(), expected.clone());
        prop_assert_eq!(stats.items_processed, expected.len() as u64);
        prop_assert_eq!(stats.last_item_id, expected.last().copied());
    }

    #[test]
    fn cursor_never_moves_backwards(
        updates in proptest::collection::vec(0i64..10_000, 1..50),
    ) {
        let modules = vec!["seo_audit".to_string()];
        let mut cycle = CycleState::new(&modules);
        let now = Utc::now();
        let mut seen = BTreeSet::new();

        for id in updates {
            cycle
                .apply_update("seo_audit", ModuleUpdate::default().with_last_id(id), now)
                .unwrap();
            seen.insert(id);
            prop_assert_eq!(
                cycle.module("seo_audit").unwrap().last_processed_id,
                seen.iter().next_back().copied()
            );
        }
    }
}
