use std::sync::Arc;
use std::time::Duration;

use strata_testing::prelude::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_up_applies_each_unit_once() {
    utils::init_test_tracing();
    let harness = TestHarness::new().await.unwrap();

    let migrators: Vec<Arc<dyn Migrator>> = (0..4)
        .map(|_| Arc::new(harness.scenario_runner().unwrap()) as Arc<dyn Migrator>)
        .collect();

    let handles: Vec<_> = migrators
        .iter()
        .cloned()
        .map(|migrator| tokio::spawn(async move { migrator.up().await }))
        .collect();

    let mut applied = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        applied.extend(result.applied_migrations);
    }
    applied.sort_unstable();

    assert_eq!(applied, vec![1, 2, 3]);
    assert_eq!(harness.db.executed_count("CREATE TABLE foo"), 1);
    assert_eq!(harness.db.executed_count("CREATE INDEX foo_name_idx"), 1);
    assert_eq!(harness.db.executed_count("ADD COLUMN bar"), 1);
    assert_eq!(
        harness
            .db
            .integer_column("schema_migrations", "version")
            .await
            .unwrap(),
        vec![1, 2, 3]
    );
    assert_eq!(harness.locks.acquisitions(), 4);
    assert_eq!(harness.locks.releases(), 4);

    for migrator in &migrators {
        assert_eq!(migrator.current_version().await.unwrap(), 3);
    }
}

#[tokio::test]
async fn test_up_waits_for_lock_holder() {
    let harness = TestHarness::new().await.unwrap();
    let runner = harness.scenario_runner().unwrap();

    assert!(harness.locks.hold(LockId::DATABASE_MIGRATION));
    let pending = tokio::spawn(async move { runner.up().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert!(harness.db.statement_log().is_empty());
    assert!(harness.locks.attempts() > 1);

    assert!(harness.locks.free(LockId::DATABASE_MIGRATION));
    let result = pending.await.unwrap().unwrap();

    assert_eq!(result.applied_count, 3);
    assert!(!harness.locks.is_held(LockId::DATABASE_MIGRATION));
}

#[tokio::test]
async fn test_distinct_lock_ids_do_not_contend() {
    let harness = TestHarness::new().await.unwrap();
    let runner = harness
        .scenario_runner()
        .unwrap()
        .with_lock_id(utils::random_lock_id());

    assert!(harness.locks.hold(LockId::DATABASE_MIGRATION));
    let result = tokio::time::timeout(Duration::from_secs(5), runner.up())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result.applied_count, 3);
}

#[tokio::test]
async fn test_lock_backend_failure_aborts_before_any_statement() {
    let harness = TestHarness::new().await.unwrap();
    harness.locks.set_unavailable(true);
    let runner = harness.scenario_runner().unwrap();

    let err = runner.up().await.unwrap_err();

    assert!(matches!(err, MigrationError::LockBackend(_)));
    assert_eq!(harness.locks.attempts(), 1);
    assert!(harness.db.statement_log().is_empty());
}

#[tokio::test]
async fn test_lock_released_after_failed_run() {
    let harness = TestHarness::new().await.unwrap();
    harness.db.fail_statements_containing("ADD COLUMN bar");
    let runner = harness.scenario_runner().unwrap();

    assert!(runner.up().await.is_err());

    assert!(!harness.locks.is_held(LockId::DATABASE_MIGRATION));
    assert_eq!(harness.locks.releases(), 1);
    assert_eq!(harness.locks.abandons(), 0);
}

#[tokio::test]
async fn test_release_failure_after_success_is_reported() {
    let harness = TestHarness::new().await.unwrap();
    harness.locks.set_failing_release(true);
    let runner = harness.scenario_runner().unwrap();

    let err = runner.up().await.unwrap_err();

    assert!(matches!(err, MigrationError::LockBackend(_)));
    assert_eq!(runner.current_version().await.unwrap(), 3);
}

#[tokio::test]
async fn test_release_failure_does_not_mask_run_failure() {
    let harness = TestHarness::new().await.unwrap();
    harness.locks.set_failing_release(true);
    harness.db.fail_statements_containing("ADD COLUMN bar");
    let runner = harness.scenario_runner().unwrap();

    let err = runner.up().await.unwrap_err();

    assert_eq!(err.failed_version(), Some(3));
}

#[tokio::test]
async fn test_cancelled_run_gives_up_the_lock() {
    let harness = TestHarness::new().await.unwrap();
    let runner = harness.scenario_runner().unwrap();

    assert!(harness.locks.hold(LockId::DATABASE_MIGRATION));
    let cancelled = tokio::time::timeout(Duration::from_millis(20), runner.up()).await;
    assert!(cancelled.is_err());
    assert!(harness.locks.free(LockId::DATABASE_MIGRATION));

    runner.up().await.unwrap();
    assert!(!harness.locks.is_held(LockId::DATABASE_MIGRATION));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_current_version_on_fresh_database() {
    let harness = TestHarness::new().await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runner = harness.scenario_runner().unwrap();
            tokio::spawn(async move { runner.current_version().await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), NO_MIGRATIONS_APPLIED);
    }
    assert!(harness.db.table_exists("schema_migrations").await.unwrap());
    assert_eq!(harness.locks.attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_current_version_during_migration_in_progress() {
    let harness = TestHarness::new().await.unwrap();
    let gate = harness.db.pause_after("ADD COLUMN bar");

    let runner = harness.scenario_runner().unwrap();
    let migrating = tokio::spawn(async move { runner.up().await });
    gate.reached().await;

    // Unit 3 is half done and uncommitted; readers see the last commit.
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let runner = harness.scenario_runner().unwrap();
            tokio::spawn(async move { runner.current_version().await })
        })
        .collect();
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), 2);
    }
    assert!(harness.locks.is_held(LockId::DATABASE_MIGRATION));
    assert!(!migrating.is_finished());

    gate.open();
    let result = migrating.await.unwrap().unwrap();

    assert_eq!(result.applied_migrations, vec![1, 2, 3]);
    assert_eq!(harness.scenario_runner().unwrap().current_version().await.unwrap(), 3);
}
