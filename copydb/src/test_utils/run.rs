use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::catalog::{
    Catalogs, Namespace, SourceConstraint, SourceIndex, SourceSequence, SourceTable,
    TableAttribute,
};
use crate::clients::{Connector, SourceSchema};
use crate::concurrency::shutdown::ShutdownRx;
use crate::context::{CopyContext, CopyOptions};
use crate::coordination::RunPaths;
use crate::test_utils::memory::ROW_BYTES;
use crate::types::Oid;

/// A run directory with initialized catalogs, removed when dropped.
#[derive(Debug)]
pub struct TestRun {
    dir: TempDir,
    pub paths: Arc<RunPaths>,
    pub catalogs: Catalogs,
}

impl TestRun {
    /// Creates the run directory layout and initializes its catalogs.
    ///
    /// # Panics
    ///
    /// Panics when the directory or the catalogs cannot be created.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create the run directory");
        let paths = RunPaths::new(dir.path());
        paths
            .create_dirs()
            .await
            .expect("failed to create the run layout");

        let catalogs = Catalogs::new(&paths.schema_dir);
        catalogs
            .init()
            .await
            .expect("failed to initialize the catalogs");

        Self {
            dir,
            paths: Arc::new(paths),
            catalogs,
        }
    }

    pub fn topdir(&self) -> &Path {
        self.dir.path()
    }

    /// Fresh handles on the catalogs of the run, as a resumed run would open them.
    pub fn reopen_catalogs(&self) -> Catalogs {
        Catalogs::new(&self.paths.schema_dir)
    }

    pub fn context<C: Connector>(
        &self,
        connector: C,
        options: CopyOptions,
        shutdown_rx: ShutdownRx,
    ) -> CopyContext<C> {
        CopyContext::new(
            self.catalogs.clone(),
            self.paths.clone(),
            Arc::new(connector),
            options,
            shutdown_rx,
        )
    }
}

/// Options of a test run: small pools, no retry delay.
pub fn test_options() -> CopyOptions {
    let mut options = CopyOptions {
        table_jobs: 2,
        index_jobs: 2,
        vacuum_jobs: 1,
        compare_jobs: 2,
        ..CopyOptions::default()
    };
    options.retry.initial_delay = std::time::Duration::from_millis(1);
    options.retry.max_delay = std::time::Duration::from_millis(5);

    options
}

fn split_qname(qname: &str) -> (&str, &str) {
    qname.split_once('.').unwrap_or(("public", qname))
}

/// A table of `rows` rows keyed on an integer primary key `id`.
pub fn test_table(oid: u32, qname: &str, rows: i64) -> SourceTable {
    let (nspname, relname) = split_qname(qname);
    let attribute = |attnum: i32, attname: &str, atttypid: u32| TableAttribute {
        attnum,
        atttypid: Oid(atttypid),
        attname: attname.to_owned(),
        attisprimary: attnum == 1,
        attisgenerated: false,
    };

    SourceTable {
        oid: Oid(oid),
        datname: None,
        qname: qname.to_owned(),
        nspname: nspname.to_owned(),
        relname: relname.to_owned(),
        amname: Some("heap".to_owned()),
        restore_list_name: format!("{nspname} {relname} postgres"),
        relpages: rows / 100,
        reltuples: rows,
        bytes: rows.max(0) as u64 * ROW_BYTES,
        exclude_data: false,
        part_key: Some("id".to_owned()),
        partcount: 0,
        attributes: vec![attribute(1, "id", 23), attribute(2, "payload", 25)],
        parts: Vec::new(),
    }
}

/// A plain btree index on `columns` of `table`.
pub fn test_index(oid: u32, table: &SourceTable, relname: &str, columns: &str) -> SourceIndex {
    SourceIndex {
        oid: Oid(oid),
        qname: format!("{}.{relname}", table.nspname),
        nspname: table.nspname.clone(),
        relname: relname.to_owned(),
        restore_list_name: format!("{} {relname} postgres", table.nspname),
        table_oid: table.oid,
        table_nspname: Some(table.nspname.clone()),
        table_relname: Some(table.relname.clone()),
        is_primary: false,
        is_unique: false,
        columns: columns.to_owned(),
        sql: format!(
            "CREATE INDEX {relname} ON {} USING btree ({columns})",
            table.qname
        ),
        constraint: None,
    }
}

/// The primary key index of `table` on `id`, with its constraint.
pub fn test_primary_key(oid: u32, constraint_oid: u32, table: &SourceTable) -> SourceIndex {
    let relname = format!("{}_pkey", table.relname);
    let mut index = test_index(oid, table, &relname, "id");
    index.is_primary = true;
    index.is_unique = true;
    index.sql = format!(
        "CREATE UNIQUE INDEX {relname} ON {} USING btree (id)",
        table.qname
    );
    index.constraint = Some(SourceConstraint {
        oid: Oid(constraint_oid),
        name: relname,
        deferrable: false,
        deferred: false,
        sql: "PRIMARY KEY (id)".to_owned(),
    });

    index
}

/// A unique index on `columns` of `table`, backing a unique constraint of the same name.
pub fn test_unique_constraint(
    oid: u32,
    constraint_oid: u32,
    table: &SourceTable,
    relname: &str,
    columns: &str,
) -> SourceIndex {
    let mut index = test_index(oid, table, relname, columns);
    index.is_unique = true;
    index.sql = format!(
        "CREATE UNIQUE INDEX {relname} ON {} USING btree ({columns})",
        table.qname
    );
    index.constraint = Some(SourceConstraint {
        oid: Oid(constraint_oid),
        name: relname.to_owned(),
        deferrable: false,
        deferred: false,
        sql: format!("UNIQUE ({columns})"),
    });

    index
}

/// A sequence owned by the `id` column of `owner`, or standalone.
pub fn test_sequence(oid: u32, qname: &str, owner: Option<&SourceTable>) -> SourceSequence {
    let (nspname, relname) = split_qname(qname);

    SourceSequence {
        oid: Oid(oid),
        ownedby: owner.map(|table| table.oid).unwrap_or_default(),
        attrelid: owner.map(|table| table.oid).unwrap_or_default(),
        attroid: Oid::INVALID,
        datname: None,
        qname: qname.to_owned(),
        nspname: nspname.to_owned(),
        relname: relname.to_owned(),
        restore_list_name: format!("{nspname} {relname} postgres"),
        last_value: 1,
        is_called: false,
    }
}

/// A schema holding `tables`, `indexes` and `sequences` and the namespaces they live in.
pub fn test_schema(
    tables: Vec<SourceTable>,
    indexes: Vec<SourceIndex>,
    sequences: Vec<SourceSequence>,
) -> SourceSchema {
    let mut namespaces: Vec<Namespace> = Vec::new();
    for nspname in tables.iter().map(|table| table.nspname.as_str()) {
        if namespaces.iter().any(|namespace| namespace.nspname == nspname) {
            continue;
        }
        namespaces.push(Namespace {
            oid: Oid(2200 + namespaces.len() as u32),
            nspname: nspname.to_owned(),
            restore_list_name: format!("- {nspname} postgres"),
        });
    }

    SourceSchema {
        namespaces,
        tables,
        indexes,
        sequences,
        ..SourceSchema::default()
    }
}
