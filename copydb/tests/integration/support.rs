use std::path::Path;

use copydb::catalog::{Catalogs, Section};
use copydb::clients::SourceSchema;
use copydb::context::CopyOptions;
use copydb::coordination::{RunMode, RunPaths};
use copydb::pipeline::{Pipeline, PipelineConfig};
use copydb::test_utils::memory::{MemoryConnector, MemoryServer};
use copydb::test_utils::run::{
    test_index, test_options, test_primary_key, test_schema, test_sequence, test_table,
    test_unique_constraint,
};
use copydb_config::shared::FilterConfig;

pub const EMPTY_OID: u32 = 16384;
pub const ITEMS_OID: u32 = 16390;
pub const ITEMS_PKEY_OID: u32 = 16391;
pub const ITEMS_PKEY_CONSTRAINT_OID: u32 = 16392;
pub const ITEMS_SKU_OID: u32 = 16393;
pub const ITEMS_SKU_CONSTRAINT_OID: u32 = 16394;
pub const ITEMS_SEQ_OID: u32 = 16395;

pub const BIG_OID: u32 = 16400;
pub const BIG_PKEY_OID: u32 = 16401;
pub const BIG_PKEY_CONSTRAINT_OID: u32 = 16402;
pub const BIG_CREATED_AT_OID: u32 = 16403;

/// An empty table and a 10k rows table with a primary key and a unique constraint, both
/// attached to their index.
pub fn items_schema() -> SourceSchema {
    let empty = test_table(EMPTY_OID, "public.empty", 0);
    let items = test_table(ITEMS_OID, "public.items", 10_000);
    let indexes = vec![
        test_primary_key(ITEMS_PKEY_OID, ITEMS_PKEY_CONSTRAINT_OID, &items),
        test_unique_constraint(
            ITEMS_SKU_OID,
            ITEMS_SKU_CONSTRAINT_OID,
            &items,
            "items_sku_key",
            "payload",
        ),
    ];
    let sequences = vec![test_sequence(ITEMS_SEQ_OID, "public.items_id_seq", Some(&items))];

    test_schema(vec![empty, items], indexes, sequences)
}

/// A 4000 rows table with a primary key and a plain index.
pub fn big_schema() -> SourceSchema {
    let big = test_table(BIG_OID, "public.big", 4_000);
    let indexes = vec![
        test_primary_key(BIG_PKEY_OID, BIG_PKEY_CONSTRAINT_OID, &big),
        test_index(BIG_CREATED_AT_OID, &big, "big_created_at_idx", "payload"),
    ];

    test_schema(vec![big], indexes, Vec::new())
}

pub fn pipeline_config(dir: &Path, mode: RunMode, options: CopyOptions) -> PipelineConfig {
    PipelineConfig {
        dir: dir.to_path_buf(),
        mode,
        options,
        filters: FilterConfig::default(),
        source_identity: Some("postgres://app@source.local/app".to_owned()),
        target_identity: Some("postgres://app@target.local/app".to_owned()),
        snapshot: None,
    }
}

pub fn full_clone_options() -> CopyOptions {
    CopyOptions {
        section: Section::All,
        ..test_options()
    }
}

pub fn pipeline(server: &MemoryServer, config: PipelineConfig) -> Pipeline<MemoryConnector> {
    Pipeline::new(config, server.connector())
}

/// Opens the catalogs a finished run left behind.
pub async fn open_catalogs(dir: &Path) -> Catalogs {
    let paths = RunPaths::new(dir);
    let catalogs = Catalogs::new(&paths.schema_dir);
    catalogs.open().await.unwrap();

    catalogs
}
