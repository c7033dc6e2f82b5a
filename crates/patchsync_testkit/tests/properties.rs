//! Properties of computed patch sets applied by the agent's applier.

use patchsync_agent::{MemoryTarget, RemoteApplier, TargetFs};
use patchsync_protocol::{ChangeKind, PatchSet, Revision, SyncMode};
use patchsync_server::{DiffEngine, DiffOptions, MemoryHistory, RevisionReader};
use patchsync_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;

struct Case {
    history: Arc<MemoryHistory>,
    before: Revision,
    after: Revision,
}

fn commit_pair(before: &Files, after: &Files) -> Case {
    let history = Arc::new(MemoryHistory::new());
    let r1 = history.commit_changes(REFERENCE, as_writes(&Files::new(), before));
    let r2 = history.commit_changes(REFERENCE, as_writes(before, after));
    Case {
        history,
        before: r1,
        after: r2,
    }
}

fn engine(case: &Case, options: DiffOptions) -> DiffEngine {
    DiffEngine::new(case.history.clone(), options)
}

fn target_holding(files: &Files) -> MemoryTarget {
    MemoryTarget::with_files(files.iter().map(|(p, c)| (p.as_str(), c.as_slice())))
}

fn rank(kind: &ChangeKind) -> u8 {
    match kind {
        ChangeKind::Deleted => 0,
        ChangeKind::Renamed { .. } => 1,
        ChangeKind::Modified => 2,
        ChangeKind::Added => 3,
    }
}

fn apply_clean(applier: &mut RemoteApplier<MemoryTarget>, set: &PatchSet) {
    let ack = applier.apply(set).unwrap();
    assert!(ack.is_clean(), "failures: {:?}", ack.results);
    assert_eq!(ack.actual_digest, set.expected_digest);
    assert_eq!(ack.current_revision.as_ref(), Some(&set.to));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn incremental_set_reaches_target_tree((before, after) in edit_strategy(12)) {
        let case = commit_pair(&before, &after);
        let set = engine(&case, DiffOptions::default()).diff(&case.before, &case.after).unwrap();
        prop_assert_eq!(set.expected_digest, digest_of(&after));

        let mut applier = RemoteApplier::new(target_holding(&before));
        apply_clean(&mut applier, &set);
        prop_assert_eq!(applier.target().snapshot(), after);
    }

    #[test]
    fn operations_follow_application_order((before, after) in edit_strategy(12)) {
        let case = commit_pair(&before, &after);
        let set = engine(&case, DiffOptions::default()).diff(&case.before, &case.after).unwrap();
        let ranks: Vec<u8> = set.ops.iter().map(|op| rank(&op.kind)).collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "out of order: {:?}", set.ops);
        for (i, op) in set.ops.iter().enumerate() {
            prop_assert_eq!(op.index as usize, i);
        }
        let mut paths: Vec<&str> = set.ops.iter().map(|op| op.path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        prop_assert_eq!(paths.len(), set.ops.len());
    }

    #[test]
    fn reapplying_a_set_changes_nothing((before, after) in edit_strategy(12)) {
        let case = commit_pair(&before, &after);
        let set = engine(&case, DiffOptions::default()).diff(&case.before, &case.after).unwrap();

        let mut applier = RemoteApplier::new(target_holding(&before));
        apply_clean(&mut applier, &set);
        let first = applier.target().snapshot();
        apply_clean(&mut applier, &set);
        prop_assert_eq!(applier.target().snapshot(), first);
    }

    #[test]
    fn full_set_replaces_any_tree(junk in tree_strategy(8), (_, after) in edit_strategy(10)) {
        let case = commit_pair(&Files::new(), &after);
        let set = engine(&case, DiffOptions::default()).full(&case.after).unwrap();
        prop_assert_eq!(set.mode, SyncMode::Full);

        let mut applier = RemoteApplier::new(target_holding(&junk));
        apply_clean(&mut applier, &set);
        prop_assert_eq!(applier.target().snapshot(), after);
        prop_assert_eq!(applier.target().digest().unwrap(), case.history.tree_digest(&case.after).unwrap());
    }

    #[test]
    fn renames_and_deltas_do_not_change_the_result((before, after) in edit_strategy(12)) {
        let case = commit_pair(&before, &after);
        let plain = DiffOptions::default().without_renames().without_deltas();
        let eager = DiffOptions::default().with_delta_threshold(0);

        for options in [plain, eager] {
            let set = engine(&case, options).diff(&case.before, &case.after).unwrap();
            let mut applier = RemoteApplier::new(target_holding(&before));
            apply_clean(&mut applier, &set);
            prop_assert_eq!(applier.target().snapshot(), after.clone());
        }
    }
}
