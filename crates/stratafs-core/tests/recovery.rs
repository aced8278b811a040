//! Recovery tests: journal replay ordering, crash-and-retry, and how
//! startup failures are reported.

use stratafs_core::mock::{MockEnv, MockEvent, MockFaults};
use stratafs_core::{ErrorKind, FsError, FsState, FsckError, OptionSet};

/// Formats and starts one device, then stops it so the journal holds a
/// checkpoint to recover from.
fn initialized(n: usize) -> MockEnv {
    let env = MockEnv::new();
    env.format_sbs(n, &OptionSet::empty());
    let fs = env.open_all(n, &OptionSet::empty()).unwrap();
    fs.stop();
    env
}

#[test]
fn shuffled_journal_replays_in_sequence_order() {
    let env = initialized(1);
    env.store
        .append_keys(&[vec![10], vec![11], vec![12], vec![13], vec![14]]);

    let mut entries = env.store.journal_entries();
    entries.reverse();
    entries.rotate_left(2);
    env.store.set_journal(entries);

    let before = env.store.replayed_seqs().len();
    let fs = env.open_all(1, &OptionSet::empty()).unwrap();
    let replayed = env.store.replayed_seqs()[before..].to_vec();

    assert_eq!(replayed, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(env.store.keys().get(&14), Some(&6));
    fs.stop();
}

#[test]
fn crash_during_replay_then_retry_applies_each_key_once() {
    let env = initialized(1);
    env.store.append_keys(&[vec![1], vec![2], vec![1, 3]]);

    env.store.set_faults(MockFaults {
        replay_fail_at: Some(4),
        ..MockFaults::default()
    });
    let err = env.open_all(1, &OptionSet::empty()).unwrap_err();
    assert!(matches!(err, FsError::Startup { step: "journal replay", .. }));
    assert_eq!(env.store.applied(), vec![(1, 2), (2, 3)]);
    assert_eq!(env.store.running_allocators(), 0);

    env.store.set_faults(MockFaults::default());
    let fs = env.open_all(1, &OptionSet::empty()).unwrap();
    assert_eq!(fs.state(), FsState::Rw);
    assert_eq!(env.store.applied(), vec![(1, 2), (2, 3), (1, 4), (3, 4)]);

    let keys = env.store.keys();
    assert_eq!(keys.get(&1), Some(&4));
    assert_eq!(keys.get(&2), Some(&3));
    assert_eq!(keys.get(&3), Some(&4));
    fs.stop();
}

#[test]
fn fsck_outcomes_map_to_consistency_errors() {
    for (result, hint) in [
        (FsckError::ErrorsNotFixed, Some("fix_errors")),
        (FsckError::RepairUnimplemented, Some("unimplemented")),
        (FsckError::RepairImpossible, None),
    ] {
        let env = initialized(1);
        env.store.set_faults(MockFaults {
            fsck_result: Some(result),
            ..MockFaults::default()
        });

        let err = env.open_all(1, &OptionSet::empty()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsistencyViolation);
        assert!(matches!(err.root_cause(), FsError::Fsck(r) if *r == result));
        let diagnosis = err.diagnosis();
        assert!(diagnosis.starts_with("fsck error"));
        if let Some(hint) = hint {
            assert!(diagnosis.contains(hint), "{diagnosis}");
        }
    }
}

#[test]
fn fix_errors_is_passed_to_fsck() {
    let env = initialized(1);
    let fs = env
        .open_all(1, &OptionSet::parse("fix_errors").unwrap())
        .unwrap();
    assert!(env
        .store
        .events()
        .contains(&MockEvent::FsckRun { auto_fix: true }));
    fs.stop();
}

#[test]
fn norecovery_skips_fsck() {
    let env = initialized(1);
    env.store.set_faults(MockFaults {
        fsck_result: Some(FsckError::RepairImpossible),
        ..MockFaults::default()
    });
    let fs = env
        .open_all(1, &OptionSet::parse("norecovery").unwrap())
        .unwrap();
    assert_eq!(fs.state(), FsState::Rw);
    fs.stop();
}

#[test]
fn journal_read_failure_is_io() {
    let env = initialized(1);
    env.store.set_faults(MockFaults {
        journal_read_fail: true,
        ..MockFaults::default()
    });
    let err = env.open_all(1, &OptionSet::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(matches!(err, FsError::Startup { step: "reading journal", .. }));
    assert_eq!(err.diagnosis(), "IO error");
}

#[test]
fn nochanges_leaves_superblocks_untouched() {
    let env = initialized(2);
    let before = env.read_sbs(2);

    let fs = env
        .open_all(2, &OptionSet::parse("nochanges").unwrap())
        .unwrap();
    assert_eq!(fs.state(), FsState::Ro);
    assert!(fs.opts().read_only);
    fs.stop();

    assert_eq!(env.read_sbs(2), before);
}

#[test]
fn clean_flag_tracks_shutdown() {
    let env = initialized(1);
    assert!(env.read_sbs(1)[0].clean);

    let fs = env.open_all(1, &OptionSet::empty()).unwrap();
    assert!(!env.read_sbs(1)[0].clean);
    assert!(env.read_sbs(1)[0].members[0].last_mount > 0);
    fs.stop();
    assert!(env.read_sbs(1)[0].clean);
}

#[test]
fn gc_failure_aborts_startup() {
    let env = initialized(1);
    env.store.set_faults(MockFaults {
        gc_run_fail: true,
        ..MockFaults::default()
    });
    let err = env.open_all(1, &OptionSet::empty()).unwrap_err();
    assert!(matches!(err, FsError::Startup { step: "mark and sweep", .. }));
    assert_eq!(env.store.running_allocators(), 0);
}
