use strata_migrate::MigrationDirection;
use strata_testing::prelude::*;

async fn migrated(harness: &TestHarness, units: Vec<MigrationUnit>) -> MigrationRunner {
    let runner = harness.runner(units).unwrap();
    runner.up().await.unwrap();
    runner
}

#[tokio::test]
async fn test_down_reverts_newest_first() {
    utils::init_test_tracing();
    let harness = TestHarness::new().await.unwrap();
    let runner = migrated(&harness, scenario_units()).await;

    let result = runner.down(1).await.unwrap();

    assert_eq!(result.rolled_back_migrations, vec![3, 2]);
    assert_eq!(result.rolled_back_count, 2);
    assert_eq!(runner.current_version().await.unwrap(), 1);
    assert!(harness.db.table_exists("foo").await.unwrap());
    assert!(!harness.db.has_column("foo", "bar").await.unwrap());
    assert!(!harness.db.index_exists("foo_name_idx").await.unwrap());

    let log = harness.db.statement_log();
    let drop_column = log.iter().position(|s| s.contains("DROP COLUMN bar")).unwrap();
    let drop_index = log.iter().position(|s| s.contains("DROP INDEX")).unwrap();
    assert!(drop_column < drop_index);
}

#[tokio::test]
async fn test_down_to_nothing() {
    let harness = TestHarness::new().await.unwrap();
    let runner = migrated(&harness, scenario_units()).await;

    let result = runner.down(NO_MIGRATIONS_APPLIED).await.unwrap();

    assert_eq!(result.rolled_back_migrations, vec![3, 2, 1]);
    assert!(!harness.db.table_exists("foo").await.unwrap());
    assert!(harness
        .db
        .integer_column("schema_migrations", "version")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(runner.current_version().await.unwrap(), NO_MIGRATIONS_APPLIED);

    // Up after a full rollback starts over.
    assert_eq!(runner.up().await.unwrap().applied_count, 3);
}

#[tokio::test]
async fn test_down_at_or_below_target_is_a_no_op() {
    let harness = TestHarness::new().await.unwrap();
    let runner = migrated(&harness, scenario_units()).await;
    harness.db.clear_statement_log();

    let result = runner.down(3).await.unwrap();

    assert_eq!(result.rolled_back_count, 0);
    assert!(result.rolled_back_migrations.is_empty());
    assert_eq!(harness.db.executed_count("DROP"), 0);
    assert_eq!(runner.current_version().await.unwrap(), 3);
}

#[tokio::test]
async fn test_irreversible_unit_blocks_down_before_any_change() {
    let harness = TestHarness::new().await.unwrap();
    let mut units = scenario_units();
    units[1].down_sql = None;
    let runner = migrated(&harness, units).await;
    harness.db.clear_statement_log();

    let err = runner.down(NO_MIGRATIONS_APPLIED).await.unwrap_err();

    assert!(matches!(err, MigrationError::IrreversibleMigration(2)));
    assert_eq!(runner.current_version().await.unwrap(), 3);
    assert!(harness.db.has_column("foo", "bar").await.unwrap());
    assert_eq!(harness.db.executed_count("DROP"), 0);

    // Stopping above the irreversible unit is still allowed.
    let result = runner.down(2).await.unwrap();
    assert_eq!(result.rolled_back_migrations, vec![3]);
}

#[tokio::test]
async fn test_current_version_missing_from_catalogue() {
    let harness = TestHarness::new().await.unwrap();
    migrated(&harness, scenario_units()).await;

    let older_build = harness.runner(scenario_units()[..2].to_vec()).unwrap();
    let err = older_build.down(1).await.unwrap_err();

    assert!(matches!(err, MigrationError::UnknownVersion(3)));
    assert!(harness.db.has_column("foo", "bar").await.unwrap());
}

#[tokio::test]
async fn test_uncatalogued_row_inside_range_blocks_down_before_any_change() {
    let harness = TestHarness::new().await.unwrap();
    let units: Vec<MigrationUnit> = scenario_units()
        .into_iter()
        .filter(|unit| unit.version != 2)
        .collect();
    let runner = migrated(&harness, units).await;
    // Recorded by a build whose catalogue had a unit 2.
    harness
        .db
        .execute("INSERT INTO schema_migrations (version) VALUES (2)")
        .await
        .unwrap();
    harness.db.clear_statement_log();

    let err = runner.down(NO_MIGRATIONS_APPLIED).await.unwrap_err();

    assert!(matches!(err, MigrationError::UnknownVersion(2)));
    assert_eq!(harness.db.executed_count("DROP"), 0);
    assert!(harness.db.has_column("foo", "bar").await.unwrap());
    assert_eq!(
        harness
            .db
            .integer_column("schema_migrations", "version")
            .await
            .unwrap(),
        vec![1, 2, 3]
    );

    // Down to the stray row's own version only reverts what is known.
    let result = runner.down(2).await.unwrap();
    assert_eq!(result.rolled_back_migrations, vec![3]);
}

#[tokio::test]
async fn test_down_skips_versions_without_rows() {
    let harness = TestHarness::new().await.unwrap();
    let runner = migrated(&harness, scenario_units()).await;
    // Unit 2 predates granular tracking: satisfied, but never recorded.
    harness
        .db
        .execute("DELETE FROM schema_migrations WHERE version = 2")
        .await
        .unwrap();

    let result = runner.down(1).await.unwrap();

    assert_eq!(result.rolled_back_migrations, vec![3]);
    assert_eq!(runner.current_version().await.unwrap(), 1);
    assert!(harness.db.index_exists("foo_name_idx").await.unwrap());
}

#[tokio::test]
async fn test_negative_target_is_rejected() {
    let harness = TestHarness::new().await.unwrap();
    let runner = migrated(&harness, scenario_units()).await;

    assert!(matches!(
        runner.down(-1).await,
        Err(MigrationError::InvalidTarget(-1))
    ));
    assert_eq!(harness.locks.acquisitions(), 1);
}

#[tokio::test]
async fn test_failing_down_stops_and_keeps_earlier_reverts() {
    let harness = TestHarness::new().await.unwrap();
    let runner = migrated(&harness, scenario_units()).await;
    harness.db.fail_statements_containing("DROP INDEX");

    let err = runner.down(NO_MIGRATIONS_APPLIED).await.unwrap_err();

    assert!(matches!(
        err,
        MigrationError::MigrationFailed {
            version: 2,
            direction: MigrationDirection::Down,
            ..
        }
    ));
    assert_eq!(runner.current_version().await.unwrap(), 2);
    assert!(!harness.db.has_column("foo", "bar").await.unwrap());
    assert!(harness.db.table_exists("foo").await.unwrap());
    assert!(!harness.locks.is_held(LockId::DATABASE_MIGRATION));
}
