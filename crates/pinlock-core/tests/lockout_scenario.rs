use pinlock_core::store::DEFAULT_SCOPE;
use pinlock_core::{
    has_enrolled_secret, FileStore, LockPolicy, LockPolicyEngine, ManualClock, PinlockConfig,
    UnlockOutcome,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const T0: i64 = 1_700_000_000_000;

fn policy() -> LockPolicy {
    LockPolicy {
        max_retry_count: 3,
        failure_delay: Duration::from_secs(60),
    }
}

#[test]
fn lockout_then_recovery_through_file_store() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let store = FileStore::open_scope(dir.path(), DEFAULT_SCOPE);
    let mut engine = LockPolicyEngine::new(store, policy()).with_clock(clock.clone());

    engine.enroll("1234").unwrap();

    for expected_count in 2..=4 {
        let outcome = engine.attempt_unlock("0000").unwrap();
        assert_eq!(
            outcome,
            UnlockOutcome::MismatchFailure {
                limit_exceeded: expected_count == 4
            }
        );
        assert_eq!(engine.lockout_state().retry_count, expected_count);
    }
    assert_eq!(engine.record().unwrap().failure_block_started_at, Some(T0));

    match engine.attempt_unlock("1234").unwrap() {
        UnlockOutcome::RetryLimitExceeded { time_remaining } => {
            assert_eq!(time_remaining.0, Duration::from_secs(60));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    clock.advance(Duration::from_secs(61));
    assert_eq!(engine.attempt_unlock("1234").unwrap(), UnlockOutcome::Success);
    assert_eq!(engine.lockout_state().retry_count, 1);

    let record = engine.record().unwrap();
    assert_eq!(record.failure_block_started_at, None);
    assert_eq!(record.last_successful_unlock_at, Some(T0 + 61_000));
}

#[test]
fn restarted_process_honours_persisted_lockout() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let path = dir.path().join("pin__preferences.json");

    {
        let mut engine =
            LockPolicyEngine::new(FileStore::new(&path), policy()).with_clock(clock.clone());
        engine.enroll("1234").unwrap();
        for _ in 0..3 {
            engine.attempt_unlock("9999").unwrap();
        }
    }

    clock.advance(Duration::from_secs(30));
    let mut restarted =
        LockPolicyEngine::new(FileStore::new(&path), policy()).with_clock(clock.clone());
    assert!(restarted.is_locked_out().unwrap());
    match restarted.attempt_unlock("1234").unwrap() {
        UnlockOutcome::RetryLimitExceeded { time_remaining } => {
            assert_eq!(time_remaining.to_string(), "30 seconds");
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    clock.advance(Duration::from_secs(30));
    assert!(!restarted.is_locked_out().unwrap());
    assert_eq!(
        restarted.attempt_unlock("1234").unwrap(),
        UnlockOutcome::Success
    );
}

#[test]
fn engines_sharing_a_store_see_each_other() {
    let dir = tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let store = Arc::new(FileStore::open_scope(dir.path(), DEFAULT_SCOPE));

    let enroller = LockPolicyEngine::new(store.clone(), policy()).with_clock(clock.clone());
    let mut verifier = LockPolicyEngine::new(store.clone(), policy()).with_clock(clock.clone());

    assert_eq!(
        verifier.attempt_unlock("1234").unwrap(),
        UnlockOutcome::NoEnrollment
    );
    enroller.enroll("1234").unwrap();
    assert!(has_enrolled_secret(&store).unwrap());
    assert!(verifier.attempt_unlock("1234").unwrap().is_success());
    assert!(!enroller
        .is_unlock_required(Duration::from_secs(5))
        .unwrap());

    enroller.clear_enrollment().unwrap();
    assert!(!has_enrolled_secret(&store).unwrap());
    assert_eq!(
        verifier.attempt_unlock("1234").unwrap(),
        UnlockOutcome::NoEnrollment
    );
}

#[test]
fn config_driven_engine_reads_legacy_document() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("work.json");
    fs::write(
        &store_path,
        r#"{"pin__saved_locked_password":"7110eda4d09e062aa5e4a390b0a572ac0d2c0220","pin__unlock_failure_time":0,"pin__unlock_success_time":0}"#,
    )
    .unwrap();

    let cfg_path = dir.path().join("pinlock.toml");
    fs::write(
        &cfg_path,
        format!(
            "[policy]\nfreshness_window_secs = 120\n\n[store]\ndir = \"{}\"\nscope = \"work\"\n",
            dir.path().display()
        ),
    )
    .unwrap();

    let config = PinlockConfig::load(&cfg_path).unwrap();
    assert_eq!(config.store_path(), store_path);
    let clock = ManualClock::new(T0);
    let mut engine = LockPolicyEngine::from_config(&config, FileStore::new(config.store_path()))
        .with_clock(clock.clone());

    assert!(engine.is_enrolled().unwrap());
    assert!(!engine.is_locked_out().unwrap());
    assert!(engine.requires_unlock().unwrap());
    assert!(engine.attempt_unlock("1234").unwrap().is_success());
    assert!(!engine.requires_unlock().unwrap());

    clock.advance(Duration::from_secs(120));
    assert!(engine.requires_unlock().unwrap());
}
