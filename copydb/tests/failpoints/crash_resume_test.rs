use std::path::Path;

use copydb::catalog::Section;
use copydb::clients::SourceSchema;
use copydb::context::CopyOptions;
use copydb::coordination::{RunMode, RunPaths, WorkUnit};
use copydb::error::ErrorKind;
use copydb::failpoints::{
    CLAIM_AFTER_MARKER, FINISH_BEFORE_SUMMARY, PARTS_DONE_BEFORE_ENQUEUE, TABLE_COPY_BEFORE_COPY,
};
use copydb::pipeline::{Pipeline, PipelineConfig};
use copydb::progress::ProgressReport;
use copydb::test_utils::failpoints::FailpointGuard;
use copydb::test_utils::memory::{MemoryConnector, MemoryServer};
use copydb::test_utils::run::{
    test_index, test_options, test_primary_key, test_schema, test_sequence, test_table,
};
use copydb::types::Oid;
use copydb_config::shared::FilterConfig;
use copydb_telemetry::tracing::init_test_tracing;

const ACCOUNTS_OID: u32 = 16600;
const ACCOUNTS_PKEY_OID: u32 = 16601;
const ACCOUNTS_PKEY_CONSTRAINT_OID: u32 = 16602;
const ACCOUNTS_SEQ_OID: u32 = 16603;
const EVENTS_OID: u32 = 16610;
const EVENTS_PKEY_OID: u32 = 16611;
const EVENTS_PKEY_CONSTRAINT_OID: u32 = 16612;
const EVENTS_PAYLOAD_OID: u32 = 16613;

/// `public.accounts` is copied whole and `public.events` in four parts.
fn crash_schema() -> SourceSchema {
    let accounts = test_table(ACCOUNTS_OID, "public.accounts", 800);
    let events = test_table(EVENTS_OID, "public.events", 4_000);

    let indexes = vec![
        test_primary_key(ACCOUNTS_PKEY_OID, ACCOUNTS_PKEY_CONSTRAINT_OID, &accounts),
        test_primary_key(EVENTS_PKEY_OID, EVENTS_PKEY_CONSTRAINT_OID, &events),
        test_index(EVENTS_PAYLOAD_OID, &events, "events_payload_idx", "payload"),
    ];
    let sequences = vec![test_sequence(
        ACCOUNTS_SEQ_OID,
        "public.accounts_id_seq",
        Some(&accounts),
    )];

    test_schema(vec![accounts, events], indexes, sequences)
}

fn crash_options() -> CopyOptions {
    CopyOptions {
        section: Section::All,
        split_tables_larger_than: Some(100_000),
        ..test_options()
    }
}

fn pipeline(server: &MemoryServer, dir: &Path, mode: RunMode) -> Pipeline<MemoryConnector> {
    let config = PipelineConfig {
        dir: dir.to_path_buf(),
        mode,
        options: crash_options(),
        filters: FilterConfig::default(),
        source_identity: Some("postgres://app@source.local/app".to_owned()),
        target_identity: Some("postgres://app@target.local/app".to_owned()),
        snapshot: None,
    };

    Pipeline::new(config, server.connector())
}

/// Runs a copy that trips the injected failure, then resumes it.
async fn crash_and_resume(server: &MemoryServer, dir: &Path) -> ProgressReport {
    let err = pipeline(server, dir, RunMode::Fresh)
        .copy()
        .await
        .unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::InjectedFailure));

    pipeline(server, dir, RunMode::Resume).copy().await.unwrap()
}

/// Every unit is done, and was done exactly once over both runs.
async fn assert_processed_once(server: &MemoryServer, dir: &Path, report: &ProgressReport) {
    assert_eq!(report.done.table_parts, 5);
    assert_eq!(report.done.indexes, 3);
    assert_eq!(report.done.constraints, 2);

    assert_eq!(server.copies_of("public.accounts").await, vec![None]);
    let mut parts = server.copies_of("public.events").await;
    parts.sort();
    assert_eq!(parts, vec![Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(server.target_rows("public.accounts").await, 800);
    assert_eq!(server.target_rows("public.events").await, 4_000);

    let executed = server.executed().await;
    let count = |prefix: &str| executed.iter().filter(|sql| sql.starts_with(prefix)).count();
    assert_eq!(count("CREATE"), 3);
    assert_eq!(count("alter table only"), 2);

    let paths = RunPaths::new(dir);
    let units = [
        WorkUnit::whole_table(Oid(ACCOUNTS_OID)),
        WorkUnit::Index {
            table_oid: Oid(EVENTS_OID),
            index_oid: Oid(EVENTS_PAYLOAD_OID),
        },
        WorkUnit::Constraint {
            table_oid: Oid(EVENTS_OID),
            constraint_oid: Oid(EVENTS_PKEY_CONSTRAINT_OID),
        },
    ];
    for unit in units {
        assert!(tokio::fs::try_exists(paths.unit_done(&unit)).await.unwrap());
        assert!(!tokio::fs::try_exists(paths.unit_lock(&unit)).await.unwrap());
    }
    assert!(!tokio::fs::try_exists(&paths.pid_file).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_claim_left_after_marker_is_taken_over() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(crash_schema());

    let report = {
        let _guard = FailpointGuard::fail_times(CLAIM_AFTER_MARKER, 1);
        crash_and_resume(&server, dir.path()).await
    };

    assert_processed_once(&server, dir.path(), &report).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unit_done_before_its_summary_is_not_repeated() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(crash_schema());

    let report = {
        let _guard = FailpointGuard::fail_times(FINISH_BEFORE_SUMMARY, 1);
        crash_and_resume(&server, dir.path()).await
    };

    assert_processed_once(&server, dir.path(), &report).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn indexes_of_an_elected_table_are_built_after_a_crash() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(crash_schema());

    let report = {
        let _guard = FailpointGuard::fail_times(PARTS_DONE_BEFORE_ENQUEUE, 1);
        crash_and_resume(&server, dir.path()).await
    };

    assert_processed_once(&server, dir.path(), &report).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_copy_is_redone_by_the_resumed_run() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(crash_schema());

    let report = {
        let _guard = FailpointGuard::fail_times(TABLE_COPY_BEFORE_COPY, 1);
        crash_and_resume(&server, dir.path()).await
    };

    assert_processed_once(&server, dir.path(), &report).await;
    assert_eq!(server.failed_copies().await, 0);
}
