//! End-to-end retention tests driving the executor against real table
//! layouts written through the test fixtures.

use std::collections::BTreeMap;

use basindb::cleaner::plan::{CLEAN_PLAN_VERSION_1, CleanPlan};
use basindb::cleaner::{CleanExecutor, CleanOutcome, MarkerCleaner};
use basindb::common::TableStorage;
use basindb::common::config::CleanerConfig;
use basindb::common::model::{
    BootstrapFileMapping, BootstrapIndex, CleaningPolicy, Instant, InstantAction, InstantState,
};
use basindb::common::testing::{TestTable, commit_metadata, data_file_path};
use basindb::common::timeline::{Timeline, TimelineWriter, meta_file_path};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn versions_config(retained: usize) -> CleanerConfig {
    CleanerConfig {
        policy: CleaningPolicy::KeepLatestFileVersions,
        retained_file_versions: retained,
        ..Default::default()
    }
}

fn commits_config(retained: usize) -> CleanerConfig {
    CleanerConfig {
        policy: CleaningPolicy::KeepLatestCommits,
        retained_commits: retained,
        ..Default::default()
    }
}

async fn run_clean(config: &CleanerConfig, table: &TestTable, ts: &str) -> CleanOutcome {
    CleanExecutor::new(config, table.storage())
        .clean(ts)
        .await
        .unwrap()
}

/// A commit writing one new base file version per (partition, file_id)
async fn commit_versions(table: &TestTable, ts: &str, writes: &[(&str, &[&str])]) {
    for (partition, file_ids) in writes {
        for file_id in *file_ids {
            table.create_data_file(partition, file_id, ts).await.unwrap();
        }
    }
    table
        .create_commit(ts, Some(&commit_metadata(ts, writes)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_keep_latest_file_versions() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    let config = versions_config(1);

    commit_versions(&table, "001", &[("p0", &["f1", "f2"]), ("p1", &["f3"])]).await;

    // Single version everywhere, nothing to do
    let outcome = run_clean(&config, &table, "002").await;
    assert!(matches!(outcome, CleanOutcome::NothingToClean));

    commit_versions(&table, "003", &[("p0", &["f1"]), ("p1", &["f3"])]).await;

    let outcome = run_clean(&config, &table, "004").await;
    let metadata = outcome.metadata().unwrap();
    assert_eq!(metadata.total_files_deleted, 2);
    assert!(metadata.earliest_commit_to_retain.is_none());

    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(!table.data_file_exists("p1", "f3", "001").await.unwrap());
    // f2 only has one version, which survives
    assert!(table.data_file_exists("p0", "f2", "001").await.unwrap());
    assert!(table.data_file_exists("p0", "f1", "003").await.unwrap());
    assert!(table.data_file_exists("p1", "f3", "003").await.unwrap());

    let timeline = Timeline::load(table.storage()).await.unwrap();
    assert_eq!(timeline.completed_cleans().len(), 1);
}

#[tokio::test]
async fn test_keep_latest_file_versions_deletes_whole_slices() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();

    // Commit 001 writes the base file, delta commit 002 stacks two logs on
    // it, commit 003 rewrites the file group
    table.create_data_file("p0", "f1", "001").await.unwrap();
    table
        .create_commit("001", Some(&commit_metadata("001", &[("p0", &["f1"])])))
        .await
        .unwrap();
    table.create_log_file("p0", "f1", "001", 1).await.unwrap();
    table.create_log_file("p0", "f1", "001", 2).await.unwrap();
    table
        .create_delta_commit("002", Some(&commit_metadata("002", &[("p0", &["f1"])])))
        .await
        .unwrap();
    commit_versions(&table, "003", &[("p0", &["f1"])]).await;

    let outcome = run_clean(&versions_config(1), &table, "004").await;
    assert_eq!(outcome.metadata().unwrap().total_files_deleted, 3);

    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(!table.log_file_exists("p0", "f1", "001", 1).await.unwrap());
    assert!(!table.log_file_exists("p0", "f1", "001", 2).await.unwrap());
    assert!(table.data_file_exists("p0", "f1", "003").await.unwrap());
}

#[tokio::test]
async fn test_keep_latest_commits_step_by_step() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    let config = commits_config(2);

    commit_versions(&table, "001", &[("p0", &["f1", "f2"]), ("p1", &["f3"])]).await;
    let outcome = run_clean(&config, &table, "090").await;
    assert!(matches!(outcome, CleanOutcome::NothingToClean));

    commit_versions(&table, "002", &[("p0", &["f1"]), ("p1", &["f3"])]).await;
    let outcome = run_clean(&config, &table, "091").await;
    assert!(matches!(outcome, CleanOutcome::NothingToClean));

    // Three commits, retaining two: version 001 is still the fallback a
    // reader at commit 002 resolves, so nothing can go yet
    commit_versions(&table, "003", &[("p0", &["f1"]), ("p1", &["f3"])]).await;
    let outcome = run_clean(&config, &table, "092").await;
    assert!(matches!(outcome, CleanOutcome::NothingToClean));
    assert!(table.data_file_exists("p0", "f1", "001").await.unwrap());

    // Fourth commit pushes the boundary past it
    commit_versions(&table, "004", &[("p0", &["f1"]), ("p1", &["f3"])]).await;
    let outcome = run_clean(&config, &table, "093").await;
    let metadata = outcome.metadata().unwrap();
    assert_eq!(metadata.earliest_commit_to_retain.as_deref(), Some("003"));
    assert_eq!(metadata.total_files_deleted, 2);

    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(!table.data_file_exists("p1", "f3", "001").await.unwrap());
    assert!(table.data_file_exists("p0", "f1", "002").await.unwrap());
    assert!(table.data_file_exists("p0", "f2", "001").await.unwrap());
}

#[tokio::test]
async fn test_keep_latest_commits_ignores_log_only_slices() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();

    // f2 never had a base file written, only deltas at commit 001
    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    table.create_log_file("p0", "f2", "001", 1).await.unwrap();
    commit_versions(&table, "002", &[("p0", &["f1"])]).await;
    commit_versions(&table, "003", &[("p0", &["f1"])]).await;
    commit_versions(&table, "004", &[("p0", &["f1"])]).await;

    let outcome = run_clean(&commits_config(2), &table, "005").await;
    assert_eq!(outcome.metadata().unwrap().total_files_deleted, 1);

    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(table.log_file_exists("p0", "f2", "001", 1).await.unwrap());
}

#[tokio::test]
async fn test_keep_latest_commits_cleans_stale_file_groups() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();

    // f1 stops being written after commit 002; later commits only touch f2
    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    commit_versions(&table, "002", &[("p0", &["f1"])]).await;
    commit_versions(&table, "003", &[("p0", &["f2"])]).await;
    commit_versions(&table, "004", &[("p0", &["f2"])]).await;
    commit_versions(&table, "005", &[("p0", &["f2"])]).await;

    let outcome = run_clean(&commits_config(2), &table, "006").await;
    let metadata = outcome.metadata().unwrap();
    assert_eq!(metadata.earliest_commit_to_retain.as_deref(), Some("004"));
    assert_eq!(metadata.total_files_deleted, 1);

    // Every version of f1 predates the boundary; only the live one, which
    // doubles as the fallback, survives
    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(table.data_file_exists("p0", "f1", "002").await.unwrap());
    // f2 keeps the window plus the fallback below it
    assert!(table.data_file_exists("p0", "f2", "003").await.unwrap());
    assert!(table.data_file_exists("p0", "f2", "004").await.unwrap());
    assert!(table.data_file_exists("p0", "f2", "005").await.unwrap());
}

/// Groups fA (no compaction), fB (pending compaction claiming the slice at
/// 002) and fC (pending compaction claiming the slice at 005)
async fn pending_compaction_fixture() -> TestTable {
    let table = TestTable::in_memory().unwrap();
    for ts in ["001", "002", "003", "004"] {
        commit_versions(&table, ts, &[("p", &["fA", "fB", "fC"])]).await;
    }
    commit_versions(&table, "005", &[("p", &["fC"])]).await;
    table
        .create_compaction_requested("006", &[("p", "fB", "002"), ("p", "fC", "005")])
        .await
        .unwrap();
    table
}

#[tokio::test]
async fn test_pending_compaction_protection_with_version_retention() {
    init_tracing();
    let table = pending_compaction_fixture().await;

    let outcome = run_clean(&versions_config(2), &table, "007").await;
    let metadata = outcome.metadata().unwrap();
    // fA loses 001 and 002, fC loses 001 and 002. All of fB's slices from
    // 002 on are claimed by the compaction and are skipped without using
    // up the retention budget, so fB loses nothing.
    assert_eq!(metadata.total_files_deleted, 4);

    for ts in ["001", "002", "003", "004"] {
        assert!(table.data_file_exists("p", "fB", ts).await.unwrap());
    }
    assert!(!table.data_file_exists("p", "fA", "001").await.unwrap());
    assert!(!table.data_file_exists("p", "fA", "002").await.unwrap());
    assert!(table.data_file_exists("p", "fA", "003").await.unwrap());
    assert!(!table.data_file_exists("p", "fC", "001").await.unwrap());
    assert!(!table.data_file_exists("p", "fC", "002").await.unwrap());
    assert!(table.data_file_exists("p", "fC", "003").await.unwrap());
}

#[tokio::test]
async fn test_pending_compaction_protection_with_commit_retention() {
    init_tracing();
    let table = pending_compaction_fixture().await;

    let outcome = run_clean(&commits_config(2), &table, "007").await;
    let metadata = outcome.metadata().unwrap();
    assert_eq!(metadata.earliest_commit_to_retain.as_deref(), Some("004"));
    // fA loses 001 and 002 (003 is the fallback below the boundary). fB
    // keeps 002 because the compaction will read it, losing only 001. fC
    // loses 001 and 002.
    assert_eq!(metadata.total_files_deleted, 5);

    assert!(table.data_file_exists("p", "fB", "002").await.unwrap());
    assert!(!table.data_file_exists("p", "fB", "001").await.unwrap());
    assert!(!table.data_file_exists("p", "fA", "002").await.unwrap());
    assert!(!table.data_file_exists("p", "fC", "002").await.unwrap());
}

#[tokio::test]
async fn test_retry_after_failed_commit_reproduces_metadata() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    let config = commits_config(2);
    for ts in ["001", "002", "003", "004"] {
        commit_versions(&table, ts, &[("p0", &["f1"]), ("p1", &["f2"])]).await;
    }

    let first = run_clean(&config, &table, "050").await;
    let CleanOutcome::Cleaned(first_metadata) = first else {
        panic!("expected a fresh clean");
    };
    assert_eq!(first_metadata.total_files_deleted, 2);

    // Simulate the completed meta write getting lost after the deletes
    // happened: put the deleted files back and drop the completed file.
    for partition in ["p0", "p1"] {
        let file_id = if partition == "p0" { "f1" } else { "f2" };
        table
            .create_data_file(partition, file_id, "001")
            .await
            .unwrap();
    }
    let timeline = Timeline::load(table.storage()).await.unwrap();
    let completed = timeline.completed_cleans().latest().unwrap().clone();
    TimelineWriter::new(table.storage())
        .revert_to_inflight(&completed)
        .await
        .unwrap();

    let second = run_clean(&config, &table, "051").await;
    let CleanOutcome::ResumedPriorAttempt(second_metadata) = second else {
        panic!("expected the pending clean to be resumed");
    };

    assert_eq!(second_metadata.partition_metadata, first_metadata.partition_metadata);
    assert_eq!(
        second_metadata.earliest_commit_to_retain,
        first_metadata.earliest_commit_to_retain
    );
    assert_eq!(
        second_metadata.total_files_deleted,
        first_metadata.total_files_deleted
    );

    // The retry completed the original instant instead of adding one
    let timeline = Timeline::load(table.storage()).await.unwrap();
    let cleans = timeline.completed_cleans();
    assert_eq!(cleans.len(), 1);
    assert_eq!(cleans.latest().unwrap().timestamp, "050");
    assert!(!timeline.contains("051"));
    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
}

#[tokio::test]
async fn test_zero_partition_commits_leave_no_clean_instant() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    table
        .create_commit("001", Some(&commit_metadata("001", &[])))
        .await
        .unwrap();

    let outcome = run_clean(&commits_config(1), &table, "002").await;
    assert!(matches!(outcome, CleanOutcome::NothingToClean));

    let timeline = Timeline::load(table.storage()).await.unwrap();
    assert!(timeline.completed_cleans().is_empty());
    assert!(timeline.pending_cleans().is_empty());
}

#[tokio::test]
async fn test_corrupted_pending_clean_does_not_block_cleaning() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    table.create_corrupted_pending_clean("002", true).await.unwrap();
    table.create_corrupted_pending_clean("004", false).await.unwrap();

    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    commit_versions(&table, "003", &[("p0", &["f1"])]).await;

    let outcome = run_clean(&versions_config(1), &table, "005").await;
    let CleanOutcome::Cleaned(metadata) = outcome else {
        panic!("corrupted pending cleans should be skipped, not resumed");
    };
    assert_eq!(metadata.total_files_deleted, 1);
    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
}

#[tokio::test]
async fn test_resumes_plan_in_old_schema_version() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let storage = TableStorage::new(&format!("file://{}", dir.path().display())).unwrap();
    let table = TestTable::new(storage.clone());

    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    commit_versions(&table, "002", &[("p0", &["f1"])]).await;

    // A pending clean left behind by a release that wrote absolute paths
    let plan = CleanPlan {
        version: CLEAN_PLAN_VERSION_1,
        policy: CleaningPolicy::KeepLatestFileVersions,
        earliest_instant_to_retain: None,
        files_to_be_deleted_per_partition: BTreeMap::from([(
            "p0".to_string(),
            vec![format!(
                "{}/{}",
                storage.base_path(),
                data_file_path("p0", "f1", "001")
            )],
        )]),
        file_paths_to_be_deleted_per_partition: BTreeMap::new(),
    };
    TimelineWriter::new(&storage)
        .create_requested("003", InstantAction::Clean, serde_json::to_vec(&plan).unwrap())
        .await
        .unwrap();

    let outcome = run_clean(&versions_config(1), &table, "004").await;
    let CleanOutcome::ResumedPriorAttempt(metadata) = outcome else {
        panic!("expected the old-version plan to be resumed");
    };
    assert_eq!(metadata.total_files_deleted, 1);
    // Executed metadata is written in the current schema: relative paths
    assert_eq!(
        metadata.partition_metadata["p0"].success_delete_files,
        vec!["f1_001.parquet"]
    );
    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
}

#[tokio::test]
async fn test_incremental_clean_matches_full_scan() {
    init_tracing();

    async fn build_table() -> TestTable {
        let table = TestTable::in_memory().unwrap();
        for ts in ["001", "002", "003"] {
            commit_versions(&table, ts, &[("p0", &["f1"]), ("p1", &["f2"])]).await;
        }
        // Establish a clean so incremental mode has a starting boundary
        let outcome = run_clean(&commits_config(1), &table, "010").await;
        assert!(outcome.metadata().is_some());
        // Later writes only touch p0
        commit_versions(&table, "011", &[("p0", &["f1"])]).await;
        table
    }

    let full_table = build_table().await;
    let incremental_table = build_table().await;

    let full = run_clean(&commits_config(1), &full_table, "020").await;
    let incremental_config = CleanerConfig {
        incremental_clean_mode: true,
        ..commits_config(1)
    };
    let incremental = run_clean(&incremental_config, &incremental_table, "020").await;

    let full_metadata = full.metadata().unwrap();
    let incremental_metadata = incremental.metadata().unwrap();
    assert_eq!(
        incremental_metadata.partition_metadata,
        full_metadata.partition_metadata
    );
    assert_eq!(
        incremental_metadata.total_files_deleted,
        full_metadata.total_files_deleted
    );
    assert_eq!(
        incremental_metadata.earliest_commit_to_retain,
        full_metadata.earliest_commit_to_retain
    );
}

#[tokio::test]
async fn test_incremental_clean_reads_previous_metadata_in_old_schema() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    for ts in ["001", "002", "003", "004", "005"] {
        commit_versions(&table, ts, &[("p0", &["f1"])]).await;
    }

    // A completed clean recorded by a release that wrote absolute paths
    let metadata_v1 = serde_json::json!({
        "version": 1,
        "start_clean_time": "0",
        "time_taken_in_millis": 3,
        "total_files_deleted": 1,
        "earliest_commit_to_retain": "002",
        "partition_metadata": {
            "p0": {
                "partition_path": "p0",
                "policy": "keep_latest_commits",
                "delete_path_patterns": ["/old/table/p0/f1_000.parquet"],
                "success_delete_files": ["/old/table/p0/f1_000.parquet"],
                "failed_delete_files": []
            }
        }
    });
    let prior_clean = Instant::new("0055", InstantAction::Clean, InstantState::Completed);
    table
        .storage()
        .put(
            &meta_file_path(&prior_clean),
            serde_json::to_vec(&metadata_v1).unwrap(),
        )
        .await
        .unwrap();

    let config = CleanerConfig {
        incremental_clean_mode: true,
        ..commits_config(2)
    };
    let outcome = run_clean(&config, &table, "006").await;
    let metadata = outcome.metadata().unwrap();
    assert_eq!(metadata.earliest_commit_to_retain.as_deref(), Some("004"));
    assert_eq!(metadata.total_files_deleted, 2);
    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(!table.data_file_exists("p0", "f1", "002").await.unwrap());
    assert!(table.data_file_exists("p0", "f1", "003").await.unwrap());
}

#[tokio::test]
async fn test_bootstrap_source_files_cleaned_with_original_version() {
    init_tracing();
    let source_dir = tempfile::TempDir::new().unwrap();
    let source_dsn = format!("file://{}", source_dir.path().display());
    let source_storage = TableStorage::new(&source_dsn).unwrap();
    let source_file = format!("p0/{}.parquet", uuid::Uuid::new_v4());
    source_storage
        .put(&source_file, b"original".to_vec())
        .await
        .unwrap();

    let table = TestTable::in_memory().unwrap();
    table
        .write_bootstrap_index(&BootstrapIndex {
            source_dsn: source_dsn.clone(),
            mappings: vec![BootstrapFileMapping {
                partition_path: "p0".to_string(),
                file_id: "f1".to_string(),
                source_path: source_file.clone(),
            }],
        })
        .await
        .unwrap();
    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    commit_versions(&table, "002", &[("p0", &["f1"])]).await;

    let config = CleanerConfig {
        clean_bootstrap_base_file_enabled: true,
        ..versions_config(1)
    };
    let outcome = run_clean(&config, &table, "003").await;
    let metadata = outcome.metadata().unwrap();

    // The bootstrapped version and its external source are both gone
    assert_eq!(metadata.total_files_deleted, 2);
    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(!source_storage.exists(&source_file).await.unwrap());
    let bootstrap = &metadata.bootstrap_partition_metadata["p0"];
    assert_eq!(bootstrap.success_delete_files.len(), 1);
    assert!(bootstrap.success_delete_files[0].ends_with(&source_file));
}

#[tokio::test]
async fn test_bootstrap_source_files_kept_by_default() {
    init_tracing();
    let source_dir = tempfile::TempDir::new().unwrap();
    let source_dsn = format!("file://{}", source_dir.path().display());
    let source_storage = TableStorage::new(&source_dsn).unwrap();
    source_storage
        .put("p0/orig-f1.parquet", b"original".to_vec())
        .await
        .unwrap();

    let table = TestTable::in_memory().unwrap();
    table
        .write_bootstrap_index(&BootstrapIndex {
            source_dsn,
            mappings: vec![BootstrapFileMapping {
                partition_path: "p0".to_string(),
                file_id: "f1".to_string(),
                source_path: "p0/orig-f1.parquet".to_string(),
            }],
        })
        .await
        .unwrap();
    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    commit_versions(&table, "002", &[("p0", &["f1"])]).await;

    let outcome = run_clean(&versions_config(1), &table, "003").await;
    assert_eq!(outcome.metadata().unwrap().total_files_deleted, 1);

    assert!(!table.data_file_exists("p0", "f1", "001").await.unwrap());
    assert!(source_storage.exists("p0/orig-f1.parquet").await.unwrap());
}

#[tokio::test]
async fn test_second_clean_finds_nothing() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    commit_versions(&table, "001", &[("p0", &["f1"])]).await;
    commit_versions(&table, "002", &[("p0", &["f1"])]).await;

    let outcome = run_clean(&versions_config(1), &table, "003").await;
    assert!(matches!(outcome, CleanOutcome::Cleaned(_)));

    let outcome = run_clean(&versions_config(1), &table, "004").await;
    assert!(matches!(outcome, CleanOutcome::NothingToClean));
    let timeline = Timeline::load(table.storage()).await.unwrap();
    assert_eq!(timeline.completed_cleans().len(), 1);
}

#[tokio::test]
async fn test_marker_cleanup_after_rollback() {
    init_tracing();
    let table = TestTable::in_memory().unwrap();
    commit_versions(&table, "001", &[("p0", &["f1"])]).await;

    // Commit 002 crashed mid-write, leaving markers for its files
    table.create_inflight_commit("002").await.unwrap();
    table.create_data_file("p0", "f1", "002").await.unwrap();
    table.create_marker_file("002", "p0_f1").await.unwrap();
    table.create_marker_file("002", "p0_f2").await.unwrap();

    let cleaner = MarkerCleaner::new(table.storage(), 4);
    assert_eq!(cleaner.delete_marker_dir("002").await.unwrap(), 2);
    assert_eq!(cleaner.delete_marker_dir("002").await.unwrap(), 0);
    table.create_rollback("003").await.unwrap();

    let timeline = Timeline::load(table.storage()).await.unwrap();
    assert!(timeline.contains("003"));
    // The rolled-back instant never published its file
    assert_eq!(timeline.completed_commits().len(), 1);
}
