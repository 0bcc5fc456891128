use copydb::catalog::{FilterKind, SourceSequence};
use copydb::clients::SourceSchema;
use copydb::coordination::RunMode;
use copydb::filter::lookup_exclusion;
use copydb::test_utils::memory::{MemoryServer, Operation};
use copydb::test_utils::run::{test_index, test_primary_key, test_schema, test_sequence, test_table};
use copydb::types::Oid;
use copydb_config::shared::QualifiedName;
use copydb_telemetry::tracing::init_test_tracing;

use crate::support::{full_clone_options, open_catalogs, pipeline, pipeline_config};

const ORDERS_OID: u32 = 16500;
const ORDERS_PKEY_OID: u32 = 16501;
const ORDERS_PKEY_CONSTRAINT_OID: u32 = 16502;
const ORDERS_PAYLOAD_OID: u32 = 16503;
const ARCHIVE_OID: u32 = 16510;
const ARCHIVE_PKEY_OID: u32 = 16511;
const ARCHIVE_PKEY_CONSTRAINT_OID: u32 = 16512;
const ARCHIVE_SEQ_OID: u32 = 16513;
const SHARED_SEQ_OID: u32 = 16514;
const SHARED_SEQ_DEFAULT_OID: u32 = 16515;

/// `public.orders` is kept and `public.archive` excluded. `public.archive_id_seq` belongs to
/// the archive only, while `public.shared_id_seq` is owned by the archive and used in a
/// default of the orders.
fn filtered_schema() -> SourceSchema {
    let orders = test_table(ORDERS_OID, "public.orders", 500);
    let archive = test_table(ARCHIVE_OID, "public.archive", 2_000);

    let indexes = vec![
        test_primary_key(ORDERS_PKEY_OID, ORDERS_PKEY_CONSTRAINT_OID, &orders),
        test_index(ORDERS_PAYLOAD_OID, &orders, "orders_payload_idx", "payload"),
        test_primary_key(ARCHIVE_PKEY_OID, ARCHIVE_PKEY_CONSTRAINT_OID, &archive),
    ];

    let shared = SourceSequence {
        attrelid: orders.oid,
        attroid: Oid(SHARED_SEQ_DEFAULT_OID),
        ..test_sequence(SHARED_SEQ_OID, "public.shared_id_seq", Some(&archive))
    };
    let sequences = vec![
        test_sequence(ARCHIVE_SEQ_OID, "public.archive_id_seq", Some(&archive)),
        shared,
    ];

    test_schema(vec![orders, archive], indexes, sequences)
}

fn exclude_archive_config(
    dir: &std::path::Path,
    mode: RunMode,
) -> copydb::pipeline::PipelineConfig {
    let mut config = pipeline_config(dir, mode, full_clone_options());
    config.filters.exclude_table = vec![QualifiedName::new("public", "archive")];

    config
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_tables_and_their_sequences_are_filtered() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(filtered_schema());

    let report = pipeline(&server, exclude_archive_config(dir.path(), RunMode::Fresh))
        .copy()
        .await
        .unwrap();

    assert_eq!(report.table_count, 1);
    assert_eq!(report.done.table_parts, 1);
    assert_eq!(report.done.indexes, 2);
    assert_eq!(report.done.constraints, 1);
    assert_eq!(server.copies_of("public.orders").await.len(), 1);
    assert!(server.copies_of("public.archive").await.is_empty());

    let executed = server.executed().await;
    assert!(!executed.iter().any(|sql| sql.contains("archive_pkey")));
    assert!(
        executed
            .iter()
            .any(|sql| sql.contains("setval('public.shared_id_seq'"))
    );
    assert!(
        !executed
            .iter()
            .any(|sql| sql.contains("setval('public.archive_id_seq'"))
    );

    let catalogs = open_catalogs(dir.path()).await;
    let filter = &catalogs.filter;

    let table = lookup_exclusion(filter, Oid(ARCHIVE_OID), None).await.unwrap();
    assert_eq!(table.map(|entry| entry.kind), Some(FilterKind::Table));

    let constraint = lookup_exclusion(filter, Oid(ARCHIVE_PKEY_CONSTRAINT_OID), None)
        .await
        .unwrap();
    assert_eq!(constraint.map(|entry| entry.kind), Some(FilterKind::Constraint));

    let sequence = lookup_exclusion(filter, Oid(ARCHIVE_SEQ_OID), None).await.unwrap();
    assert_eq!(sequence.map(|entry| entry.kind), Some(FilterKind::Sequence));

    // The shared sequence itself is kept; only its ownership by the archive is filtered.
    assert!(
        lookup_exclusion(filter, Oid(SHARED_SEQ_OID), None)
            .await
            .unwrap()
            .is_none()
    );
    let owned_by = lookup_exclusion(filter, Oid::INVALID, Some("public shared_id_seq postgres"))
        .await
        .unwrap();
    assert_eq!(
        owned_by.map(|entry| entry.kind),
        Some(FilterKind::SequenceOwnedBy)
    );

    assert!(
        lookup_exclusion(filter, Oid(ORDERS_OID), Some("public orders postgres"))
            .await
            .unwrap()
            .is_none()
    );
    catalogs.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_list_comments_out_filtered_and_processed_entries() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(filtered_schema());

    pipeline(&server, exclude_archive_config(dir.path(), RunMode::Fresh))
        .copy()
        .await
        .unwrap();

    let input = dir.path().join("pre.list");
    let output = dir.path().join("pre.filtered.list");
    let list = [
        ";",
        "; Archive created at 2026-10-19 09:12:44 UTC",
        ";",
        "210; 1259 16500 TABLE public orders postgres",
        "211; 1259 16510 TABLE public archive postgres",
        "212; 1259 16513 SEQUENCE public archive_id_seq postgres",
        "213; 0 0 SEQUENCE OWNED BY public archive_id_seq postgres",
        "214; 0 0 SEQUENCE OWNED BY public shared_id_seq postgres",
        "3380; 0 16500 TABLE DATA public orders postgres",
        "3381; 0 16510 TABLE DATA public archive postgres",
        "3390; 2606 16502 CONSTRAINT public orders orders_pkey postgres",
        "3391; 2606 16512 CONSTRAINT public archive archive_pkey postgres",
        "3392; 1259 16503 INDEX public orders_payload_idx postgres",
    ]
    .join("\n");
    tokio::fs::write(&input, list).await.unwrap();

    let summary = pipeline(&server, exclude_archive_config(dir.path(), RunMode::Resume))
        .filter_toc(&input, &output)
        .await
        .unwrap();

    assert_eq!(summary.restored, 2);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.filtered, 6);

    let written = tokio::fs::read_to_string(&output).await.unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(lines[0], "210; 1259 16500 TABLE public orders postgres");
    assert_eq!(lines[1], ";211; 1259 16510 TABLE public archive postgres");
    assert_eq!(lines[4], ";214; 0 0 SEQUENCE OWNED BY public shared_id_seq postgres");
    assert_eq!(lines[5], "3380; 0 16500 TABLE DATA public orders postgres");
    assert_eq!(lines[7], ";3390; 2606 16502 CONSTRAINT public orders orders_pkey postgres");
    assert_eq!(lines[9], ";3392; 1259 16503 INDEX public orders_payload_idx postgres");

    assert!(
        !server
            .journal()
            .await
            .iter()
            .any(|operation| matches!(operation, Operation::Copy { qname, .. } if qname == "public.archive"))
    );
}
