//! Property tests for the checkpoint store's resumption invariants.

use proptest::prelude::*;
use tempfile::TempDir;

use barsync_runner::checkpoint::{CheckpointStore, JsonCheckpointStore};

/// One recorded per-symbol outcome, as the driver would issue it.
#[derive(Debug, Clone)]
enum Op {
    Update { succeeded: bool },
    Skip,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(|succeeded| Op::Update { succeeded }),
        Just(Op::Skip),
    ]
}

proptest! {
    /// `resume_from` is monotone non-decreasing and always one past the
    /// highest index recorded, whatever mix of updates and skips arrives.
    #[test]
    fn resume_from_tracks_highest_recorded_index(
        ops in proptest::collection::vec((0usize..50, op_strategy()), 1..40)
    ) {
        let dir = TempDir::new().unwrap();
        let store = JsonCheckpointStore::open(dir.path()).unwrap();
        store.start("prop", 50).unwrap();

        let mut highest = 0usize;
        let mut last_resume = 0usize;
        for (index, op) in &ops {
            match op {
                Op::Update { succeeded } => {
                    store.update_symbol(&format!("S{index}"), *succeeded, *index).unwrap()
                }
                Op::Skip => store.skip_symbol(&format!("S{index}"), *index).unwrap(),
            }
            highest = highest.max(*index);
            let resume = store.current_run().unwrap().resume_from;
            prop_assert!(resume >= last_resume);
            last_resume = resume;
        }
        prop_assert_eq!(last_resume, highest + 1);
    }

    /// A symbol's failure count is exactly its failures since the last
    /// success, regardless of interleaved skips.
    #[test]
    fn failure_count_is_failures_since_last_success(
        outcomes in proptest::collection::vec(op_strategy(), 1..30)
    ) {
        let dir = TempDir::new().unwrap();
        let store = JsonCheckpointStore::open(dir.path()).unwrap();
        store.start("prop", 1).unwrap();

        let mut expected = 0u32;
        for op in &outcomes {
            match op {
                Op::Update { succeeded: true } => {
                    store.update_symbol("AAA", true, 0).unwrap();
                    expected = 0;
                }
                Op::Update { succeeded: false } => {
                    store.update_symbol("AAA", false, 0).unwrap();
                    expected += 1;
                }
                // Skips record no new attempt.
                Op::Skip => store.skip_symbol("AAA", 0).unwrap(),
            }
            prop_assert_eq!(
                store.symbol_checkpoint("AAA").unwrap().failure_count,
                expected
            );
        }
    }
}
