use std::time::Duration;

use copydb::coordination::RunMode;
use copydb::error::ErrorKind;
use copydb::test_utils::memory::MemoryServer;
use copydb::test_utils::run::{test_schema, test_table};
use copydb_config::shared::QualifiedName;
use copydb_telemetry::tracing::init_test_tracing;

use crate::support::{full_clone_options, items_schema, pipeline, pipeline_config};

#[tokio::test(flavor = "multi_thread")]
async fn resume_only_processes_unfinished_units() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    server
        .fail_copies("public.items", 1, ErrorKind::SourceQueryFailed)
        .await;

    pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    )
    .copy()
    .await
    .unwrap_err();
    let statements_before = server.executed().await.len();

    let report = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Resume, full_clone_options()),
    )
    .copy()
    .await
    .unwrap();

    assert_eq!(report.done.table_parts, 2);
    assert_eq!(report.done.indexes, 2);
    assert_eq!(report.done.constraints, 2);
    assert_eq!(server.copies_of("public.empty").await, vec![None]);
    assert_eq!(server.copies_of("public.items").await, vec![None]);

    // The resumed index builds tolerate indexes left by the interrupted run.
    let resumed = server.executed().await.split_off(statements_before);
    assert!(resumed.contains(
        &"CREATE UNIQUE INDEX IF NOT EXISTS items_pkey ON public.items USING btree (id)".to_owned()
    ));

    // Once complete, resuming again does nothing.
    let statements = server.executed().await.len();
    pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Resume, full_clone_options()),
    )
    .copy()
    .await
    .unwrap();
    assert_eq!(server.executed().await.len(), statements);
    assert_eq!(server.copies_of("public.items").await, vec![None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_runs_refuse_a_previous_run_and_restart_starts_over() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());

    pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    )
    .copy()
    .await
    .unwrap();

    let err = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    )
    .copy()
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(server.copies_of("public.items").await, vec![None]);

    pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Restart, full_clone_options()),
    )
    .copy()
    .await
    .unwrap();
    assert_eq!(server.copies_of("public.items").await, vec![None, None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn resuming_against_another_setup_is_refused() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());

    pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    )
    .copy()
    .await
    .unwrap();

    let mut other_source = pipeline_config(dir.path(), RunMode::Resume, full_clone_options());
    other_source.source_identity = Some("postgres://app@elsewhere.local/app".to_owned());
    let err = pipeline(&server, other_source).copy().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);

    let mut other_filters = pipeline_config(dir.path(), RunMode::Resume, full_clone_options());
    other_filters
        .filters
        .exclude_table
        .push(QualifiedName::new("public", "empty"));
    let err = pipeline(&server, other_filters).copy().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMismatch);

    assert_eq!(server.copies_of("public.items").await, vec![None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_the_copy_and_resume_finishes_it() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let tables = (0..6)
        .map(|i| test_table(17000 + i, &format!("public.t{i}"), 100))
        .collect();
    let server = MemoryServer::new(test_schema(tables, Vec::new(), Vec::new()));
    server.set_copy_delay(Duration::from_millis(50)).await;

    let mut options = full_clone_options();
    options.table_jobs = 1;
    let first = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, options.clone()),
    );
    let shutdown_tx = first.shutdown_tx();
    let copied_one = server.notify_on_copies(1).await;

    let handle = tokio::spawn(async move { first.copy().await });
    copied_one.notified().await;
    shutdown_tx.shutdown().unwrap();

    let report = handle.await.unwrap().unwrap();
    assert!(report.done.table_parts < 6);

    let report = pipeline(&server, pipeline_config(dir.path(), RunMode::Resume, options))
        .copy()
        .await
        .unwrap();
    assert_eq!(report.done.table_parts, 6);
    for i in 0..6 {
        assert_eq!(
            server.copies_of(&format!("public.t{i}")).await,
            vec![None],
            "table t{i} must be copied exactly once"
        );
    }
}
