use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::catalog::{
    Collation, Depend, Extension, Namespace, SourceIndex, SourceSequence, SourceTable,
    TableChecksum, TablePart,
};
use crate::error::CopyDbResult;
use crate::types::{Oid, PgLsn};

/// Everything fetched from the source catalogs in one pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceSchema {
    pub namespaces: Vec<Namespace>,
    pub extensions: Vec<Extension>,
    pub collations: Vec<Collation>,
    /// Tables with their attributes, without parts.
    pub tables: Vec<SourceTable>,
    pub indexes: Vec<SourceIndex>,
    pub sequences: Vec<SourceSequence>,
}

/// Queries run against the source server.
///
/// A source client holds a single connection. When a snapshot is set, every later query of the
/// client reads from it.
#[async_trait]
pub trait SourceClient: Send {
    /// Opens a repeatable read transaction and exports its snapshot.
    ///
    /// The client must stay open for as long as other clients import the snapshot.
    async fn export_snapshot(&mut self) -> CopyDbResult<String>;

    /// Opens a repeatable read transaction reading from `snapshot`.
    async fn set_snapshot(&mut self, snapshot: &str) -> CopyDbResult<()>;

    async fn fetch_schema(&mut self) -> CopyDbResult<SourceSchema>;

    /// Dependency edges of objects depending on any of `relations`.
    async fn fetch_depends(&mut self, relations: &[Oid]) -> CopyDbResult<Vec<Depend>>;

    /// Smallest and largest value of the integer `column` of `qname`, `None` when empty.
    async fn key_range(&mut self, qname: &str, column: &str) -> CopyDbResult<Option<(i64, i64)>>;

    async fn table_checksum(&mut self, qname: &str) -> CopyDbResult<TableChecksum>;

    /// Current `(last_value, is_called)` of a sequence.
    async fn sequence_value(&mut self, qname: &str) -> CopyDbResult<(i64, bool)>;

    async fn current_wal_lsn(&mut self) -> CopyDbResult<PgLsn>;
}

/// Statements run against the target server.
#[async_trait]
pub trait TargetClient: Send {
    /// Runs one or more statements, returning the rows affected by the last one.
    async fn execute(&mut self, sql: &str) -> CopyDbResult<u64>;

    /// Indexes and index-backed constraints already present on the target.
    async fn fetch_indexes(&mut self) -> CopyDbResult<Vec<SourceIndex>>;

    async fn table_checksum(&mut self, qname: &str) -> CopyDbResult<TableChecksum>;
}

/// Opens source and target clients and moves table rows between them.
///
/// Workers receive the connector behind an `Arc` and open their own clients, so an
/// implementation must be shareable across tasks.
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync + 'static {
    type Source: SourceClient + Sync;
    type Target: TargetClient + Sync;

    async fn connect_source(&self) -> CopyDbResult<Self::Source>;

    async fn connect_target(&self) -> CopyDbResult<Self::Target>;

    /// Streams the rows selected by `copy` from `source` into `target`.
    ///
    /// Returns the number of bytes transferred. The target rows of the unit must have been
    /// cleared by [`CopySpec::prepare_sql`] beforehand.
    async fn copy_rows(
        &self,
        source: &mut Self::Source,
        target: &mut Self::Target,
        copy: &CopySpec,
    ) -> CopyDbResult<u64>;
}

/// Description of the rows of one copy unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    pub table_oid: Oid,
    pub qname: String,
    /// Quoted names of the columns to copy; generated columns are left out.
    pub columns: Vec<String>,
    pub part: Option<TablePart>,
    pub part_key: Option<String>,
}

impl CopySpec {
    pub fn new(table: &SourceTable, part: Option<TablePart>) -> Self {
        let columns = table
            .attributes
            .iter()
            .filter(|attribute| !attribute.attisgenerated)
            .map(|attribute| pg_escape::quote_identifier(&attribute.attname).into_owned())
            .collect();

        Self {
            table_oid: table.oid,
            qname: table.qname.clone(),
            columns,
            part,
            part_key: table.part_key.clone(),
        }
    }

    /// Row filter of the part, when the unit is one part of a split table.
    pub fn predicate(&self) -> Option<String> {
        let part = self.part.as_ref()?;
        let part_key = self.part_key.as_deref()?;

        Some(part.predicate(part_key))
    }

    fn column_list(&self) -> String {
        self.columns.join(", ")
    }

    /// `COPY ... TO STDOUT` run on the source.
    pub fn source_sql(&self) -> String {
        match self.predicate() {
            Some(predicate) => format!(
                "copy (select {} from only {} where {}) to stdout",
                self.column_list(),
                self.qname,
                predicate
            ),
            None if self.columns.is_empty() => format!("copy {} to stdout", self.qname),
            None => format!("copy {} ({}) to stdout", self.qname, self.column_list()),
        }
    }

    /// `COPY ... FROM STDIN` run on the target.
    pub fn target_sql(&self) -> String {
        if self.columns.is_empty() {
            format!("copy {} from stdin", self.qname)
        } else {
            format!("copy {} ({}) from stdin", self.qname, self.column_list())
        }
    }

    /// Clears the rows of the unit on the target, so that a retried copy starts afresh.
    pub fn prepare_sql(&self) -> String {
        match self.predicate() {
            Some(predicate) => format!("delete from only {} where {}", self.qname, predicate),
            None => format!("truncate only {}", self.qname),
        }
    }
}

impl fmt::Display for CopySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.part {
            Some(part) => write!(f, "{} part {}/{}", self.qname, part.partnum, part.partcount),
            None => write!(f, "{}", self.qname),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableAttribute;

    fn table() -> SourceTable {
        let attribute = |attnum: i32, attname: &str, attisgenerated: bool| TableAttribute {
            attnum,
            atttypid: Oid(23),
            attname: attname.to_string(),
            attisprimary: attnum == 1,
            attisgenerated,
        };

        SourceTable {
            oid: Oid(16384),
            datname: None,
            qname: "public.orders".to_string(),
            nspname: "public".to_string(),
            relname: "orders".to_string(),
            amname: None,
            restore_list_name: "public orders postgres".to_string(),
            relpages: 0,
            reltuples: 0,
            bytes: 0,
            exclude_data: false,
            part_key: Some("id".to_string()),
            partcount: 2,
            attributes: vec![
                attribute(1, "id", false),
                attribute(2, "Total", false),
                attribute(3, "total_x2", true),
            ],
            parts: Vec::new(),
        }
    }

    #[test]
    fn whole_table_copies_skip_generated_columns() {
        let copy = CopySpec::new(&table(), None);

        assert_eq!(
            copy.source_sql(),
            "copy public.orders (id, \"Total\") to stdout"
        );
        assert_eq!(
            copy.target_sql(),
            "copy public.orders (id, \"Total\") from stdin"
        );
        assert_eq!(copy.prepare_sql(), "truncate only public.orders");
    }

    #[test]
    fn part_copies_select_and_clear_their_range() {
        let part = TablePart {
            partnum: 1,
            partcount: 2,
            min: None,
            max: Some(499),
            count: 500,
        };
        let copy = CopySpec::new(&table(), Some(part));

        assert_eq!(
            copy.source_sql(),
            "copy (select id, \"Total\" from only public.orders where id <= 499) to stdout"
        );
        assert_eq!(
            copy.prepare_sql(),
            "delete from only public.orders where id <= 499"
        );
        assert_eq!(copy.to_string(), "public.orders part 1/2");
    }
}
