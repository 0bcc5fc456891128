use copydb::coordination::{Phase, RunMode, RunPaths, WorkUnit};
use copydb::error::ErrorKind;
use copydb::test_utils::memory::{MemoryServer, Operation, ROW_BYTES};
use copydb::types::Oid;
use copydb_telemetry::tracing::init_test_tracing;

use crate::support::{
    BIG_OID, EMPTY_OID, ITEMS_OID, big_schema, full_clone_options, items_schema, open_catalogs,
    pipeline, pipeline_config,
};

fn position(statements: &[String], sql: &str) -> usize {
    statements
        .iter()
        .position(|statement| statement == sql)
        .unwrap_or_else(|| panic!("statement not run on the target: {sql}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn clone_processes_every_unit_once() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    server
        .set_sequence_value("public.items_id_seq", 10_000, true)
        .await;

    let pipeline = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    );
    let report = pipeline.copy().await.unwrap();

    assert_eq!(report.table_count, 2);
    assert_eq!(report.index_count, 2);
    assert_eq!(report.done.table_parts, 2);
    assert_eq!(report.done.indexes, 2);
    assert_eq!(report.done.constraints, 2);
    assert_eq!(report.done.bytes, 10_000 * ROW_BYTES);

    assert_eq!(server.copies_of("public.empty").await, vec![None]);
    assert_eq!(server.copies_of("public.items").await, vec![None]);
    assert_eq!(server.target_rows("public.items").await, 10_000);

    let executed = server.executed().await;
    let pkey_index = position(
        &executed,
        "CREATE UNIQUE INDEX items_pkey ON public.items USING btree (id)",
    );
    let sku_index = position(
        &executed,
        "CREATE UNIQUE INDEX items_sku_key ON public.items USING btree (payload)",
    );
    let pkey = position(
        &executed,
        "alter table only public.items add constraint items_pkey primary key using index items_pkey",
    );
    let sku = position(
        &executed,
        "alter table only public.items add constraint items_sku_key unique using index items_sku_key",
    );
    assert!(pkey_index < pkey && sku_index < pkey);
    assert!(pkey_index < sku && sku_index < sku);
    assert_eq!(
        executed
            .iter()
            .filter(|sql| sql.starts_with("alter table"))
            .count(),
        2
    );

    assert!(executed.contains(&"vacuum analyze public.items".to_owned()));
    assert!(executed.contains(&"vacuum analyze public.empty".to_owned()));
    assert!(executed.contains(&"select pg_catalog.setval('public.items_id_seq', 10000, true)".to_owned()));

    let paths = RunPaths::new(dir.path());
    for phase in [Phase::Tables, Phase::Indexes, Phase::Sequences, Phase::Vacuum] {
        assert!(
            tokio::fs::try_exists(paths.phase_done(phase)).await.unwrap(),
            "missing done marker of {phase}"
        );
    }
    assert!(tokio::fs::try_exists(&paths.summary_file).await.unwrap());
    assert!(!tokio::fs::try_exists(&paths.pid_file).await.unwrap());

    let catalogs = open_catalogs(dir.path()).await;
    for table_oid in [EMPTY_OID, ITEMS_OID] {
        let unit = WorkUnit::whole_table(Oid(table_oid));
        let summary = catalogs.source.lookup_summary(&unit).await.unwrap().unwrap();
        assert!(summary.is_done());
        assert!(tokio::fs::try_exists(paths.unit_done(&unit)).await.unwrap());
    }
    catalogs.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn split_table_survives_transient_connection_failures() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(big_schema());
    server
        .fail_copies("public.big", 2, ErrorKind::SourceConnectionFailed)
        .await;

    let mut options = full_clone_options();
    options.split_tables_larger_than = Some(100_000);
    let report = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, options.clone()),
    )
    .copy()
    .await
    .unwrap();

    assert_eq!(report.done.table_parts, 4);
    assert_eq!(report.done.indexes, 2);
    assert_eq!(report.done.constraints, 1);
    assert_eq!(server.failed_copies().await, 2);

    let mut parts = server.copies_of("public.big").await;
    parts.sort();
    assert_eq!(parts, vec![Some(1), Some(2), Some(3), Some(4)]);
    assert_eq!(server.target_rows("public.big").await, 4_000);

    let paths = RunPaths::new(dir.path());
    for partnum in 1..=4 {
        let unit = WorkUnit::TablePart {
            table_oid: Oid(BIG_OID),
            partnum,
        };
        assert!(tokio::fs::try_exists(paths.unit_done(&unit)).await.unwrap());
    }

    // Index builds start only once the last part is copied, and only once.
    let journal = server.journal().await;
    let last_copy = journal
        .iter()
        .rposition(|operation| matches!(operation, Operation::Copy { .. }))
        .unwrap();
    let index_builds: Vec<usize> = journal
        .iter()
        .enumerate()
        .filter(|(_, operation)| {
            matches!(operation, Operation::Execute(sql) if sql.starts_with("CREATE"))
        })
        .map(|(position, _)| position)
        .collect();
    assert_eq!(index_builds.len(), 2);
    assert!(index_builds.iter().all(|&position| position > last_copy));

    // Split parameters must match the ones recorded by the copy.
    let comparison = pipeline(&server, pipeline_config(dir.path(), RunMode::Resume, options))
        .compare()
        .await
        .unwrap();
    assert_eq!(comparison.len(), 1);
    assert!(comparison[0].matches());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_units_are_reported_after_the_rest_is_copied() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    server
        .fail_copies("public.items", 1, ErrorKind::SourceQueryFailed)
        .await;

    let pipeline = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    );
    let err = pipeline.copy().await.unwrap_err();

    assert!(err.kinds().contains(&ErrorKind::SourceQueryFailed));
    assert_eq!(server.copies_of("public.empty").await, vec![None]);
    assert!(server.copies_of("public.items").await.is_empty());
    assert!(
        !tokio::fs::try_exists(RunPaths::new(dir.path()).phase_done(Phase::Tables))
            .await
            .unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn compare_reports_missing_rows() {
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

    server.set_source_rows("public.items", 10_001).await;

    let err = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Resume, full_clone_options()),
    )
    .compare()
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
}
