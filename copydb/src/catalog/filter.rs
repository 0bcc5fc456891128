//! The unified exclusion index of the filter catalog.
//!
//! The filter catalog holds the objects the user's filters exclude, fetched with the inverse
//! of the source queries. [`Catalog::prepare_filter`] turns them into `filter` rows, keyed by
//! oid and by archive restore-list name, that the copy and restore steps consult.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::info;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::copydb_error;
use crate::error::{CopyDbError, CopyDbResult, ErrorKind};
use crate::types::Oid;

/// Why an entry is excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    Table,
    Matview,
    Index,
    Constraint,
    /// A sequence excluded by its own name and not used by any retained table.
    Sequence,
    /// `ALTER SEQUENCE ... OWNED BY` of a sequence whose owner table is excluded.
    SequenceOwnedBy,
    /// Column default referencing a sequence of an excluded table.
    Default,
    Depend,
    Extension,
    Collation,
}

impl FilterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterKind::Table => "table",
            FilterKind::Matview => "matview",
            FilterKind::Index => "index",
            FilterKind::Constraint => "constraint",
            FilterKind::Sequence => "sequence",
            FilterKind::SequenceOwnedBy => "sequence owned by",
            FilterKind::Default => "default",
            FilterKind::Depend => "pg_depend",
            FilterKind::Extension => "extension",
            FilterKind::Collation => "coll",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKind {
    type Err = CopyDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "table" => FilterKind::Table,
            "matview" => FilterKind::Matview,
            "index" => FilterKind::Index,
            "constraint" => FilterKind::Constraint,
            "sequence" => FilterKind::Sequence,
            "sequence owned by" => FilterKind::SequenceOwnedBy,
            "default" => FilterKind::Default,
            "pg_depend" => FilterKind::Depend,
            "extension" => FilterKind::Extension,
            "coll" => FilterKind::Collation,
            other => {
                return Err(copydb_error!(
                    ErrorKind::InvalidData,
                    "Unknown filter kind",
                    format!("kind: {other:?}")
                ));
            }
        };

        Ok(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub oid: Option<Oid>,
    pub restore_list_name: Option<String>,
    pub kind: FilterKind,
}

/// Object classes excluded wholesale rather than by the user's filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub skip_extensions: bool,
    pub skip_collations: bool,
}

impl Catalog {
    /// Builds the `filter` rows of this filter catalog against the retained objects of
    /// `source`.
    ///
    /// Runs every insert on one connection with `source` attached; any failure leaves the
    /// error to the caller, which must not use a partially prepared filter.
    pub async fn prepare_filter(
        &self,
        source: &Catalog,
        options: FilterOptions,
    ) -> CopyDbResult<u64> {
        let mut attached = self.attach(source, "source").await?;

        let mut statements = vec![Statement::FilterPrepareObjects, Statement::FilterPrepareDepend];
        if options.skip_extensions {
            statements.push(Statement::FilterPrepareExtensions);
        }
        if options.skip_collations {
            statements.push(Statement::FilterPrepareCollations);
        }

        let mut rows = 0;
        for statement in statements {
            rows += attached.execute(statement).await?;
        }

        attached.detach().await?;

        info!(entries = rows, "prepared filter catalog");

        Ok(rows)
    }

    /// Adds one entry; an entry with the same oid already present is kept.
    pub async fn add_filter(&self, entry: &FilterEntry) -> CopyDbResult<()> {
        let kind = entry.kind.as_str();

        self.run(Statement::FilterInsert, |pool| async move {
            sqlx::query(Statement::FilterInsert.sql())
                .bind(entry.oid)
                .bind(entry.restore_list_name.as_deref())
                .bind(kind)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_filter_by_oid(&self, oid: Oid) -> CopyDbResult<Option<FilterEntry>> {
        let row = self
            .run_locked(Statement::FilterSelectByOid, |pool| async move {
                sqlx::query(Statement::FilterSelectByOid.sql())
                    .bind(oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        row.as_ref().map(filter_from_row).transpose()
    }

    /// First entry registered under `restore_list_name`; several entries may share a name.
    pub async fn lookup_filter_by_restore_list_name(
        &self,
        restore_list_name: &str,
    ) -> CopyDbResult<Option<FilterEntry>> {
        let row = self
            .run_locked(Statement::FilterSelectByRestoreListName, |pool| async move {
                sqlx::query(Statement::FilterSelectByRestoreListName.sql())
                    .bind(restore_list_name)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        row.as_ref().map(filter_from_row).transpose()
    }

    pub async fn count_filters(&self) -> CopyDbResult<u64> {
        let count: i64 = self
            .run(Statement::FilterCount, |pool| async move {
                sqlx::query_scalar(Statement::FilterCount.sql())
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(count as u64)
    }
}

fn filter_from_row(row: &SqliteRow) -> CopyDbResult<FilterEntry> {
    let kind: String = row.get("kind");

    Ok(FilterEntry {
        oid: row.get("oid"),
        restore_list_name: row.get("restore_list_name"),
        kind: kind.parse()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sequence::SourceSequence;
    use crate::catalog::objects::Extension;
    use crate::catalog::store::Catalogs;
    use crate::catalog::table::SourceTable;

    fn table(oid: u32, relname: &str) -> SourceTable {
        SourceTable {
            oid: Oid(oid),
            datname: None,
            qname: format!("public.{relname}"),
            nspname: "public".to_string(),
            relname: relname.to_string(),
            amname: None,
            restore_list_name: format!("public {relname} postgres"),
            relpages: 0,
            reltuples: 0,
            bytes: 0,
            exclude_data: false,
            part_key: None,
            partcount: 0,
            attributes: Vec::new(),
            parts: Vec::new(),
        }
    }

    fn owned_sequence(oid: u32, ownedby: u32) -> SourceSequence {
        SourceSequence {
            oid: Oid(oid),
            ownedby: Oid(ownedby),
            attrelid: Oid(ownedby),
            attroid: Oid::INVALID,
            datname: None,
            qname: "public.shared_seq".to_string(),
            nspname: "public".to_string(),
            relname: "shared_seq".to_string(),
            restore_list_name: "public shared_seq postgres".to_string(),
            last_value: 1,
            is_called: false,
        }
    }

    #[test]
    fn kinds_round_trip_through_text() {
        for kind in [FilterKind::SequenceOwnedBy, FilterKind::Depend, FilterKind::Collation] {
            assert_eq!(kind.as_str().parse::<FilterKind>().unwrap(), kind);
        }
        assert!("view".parse::<FilterKind>().is_err());
    }

    #[tokio::test]
    async fn owned_by_is_filtered_even_when_the_sequence_is_retained() {
        let dir = tempfile::tempdir().unwrap();
        let catalogs = Catalogs::new(dir.path());
        catalogs.init().await.unwrap();

        // The sequence is retained through the kept table `a`, and owned by the excluded `b`.
        catalogs.source.add_table(&table(100, "a")).await.unwrap();
        let mut retained = owned_sequence(500, 0);
        retained.attrelid = Oid(100);
        catalogs.source.add_sequence(&retained).await.unwrap();

        catalogs.filter.add_table(&table(200, "b")).await.unwrap();
        catalogs
            .filter
            .add_sequence(&owned_sequence(500, 200))
            .await
            .unwrap();

        catalogs
            .filter
            .prepare_filter(&catalogs.source, FilterOptions::default())
            .await
            .unwrap();

        assert!(catalogs.filter.lookup_filter_by_oid(Oid(500)).await.unwrap().is_none());
        assert_eq!(
            catalogs
                .filter
                .lookup_filter_by_oid(Oid(200))
                .await
                .unwrap()
                .unwrap()
                .kind,
            FilterKind::Table
        );

        let owned_by = catalogs
            .filter
            .lookup_filter_by_restore_list_name("public shared_seq postgres")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owned_by.kind, FilterKind::SequenceOwnedBy);
        assert_eq!(owned_by.oid, None);
    }

    #[tokio::test]
    async fn skipped_extensions_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let catalogs = Catalogs::new(dir.path());
        catalogs.init().await.unwrap();

        catalogs
            .filter
            .add_extension(&Extension {
                oid: Oid(900),
                extname: "postgis".to_string(),
                extnamespace: "public".to_string(),
                extrelocatable: false,
                config: Vec::new(),
            })
            .await
            .unwrap();

        let options = FilterOptions {
            skip_extensions: true,
            skip_collations: false,
        };
        catalogs
            .filter
            .prepare_filter(&catalogs.source, options)
            .await
            .unwrap();

        let entry = catalogs
            .filter
            .lookup_filter_by_oid(Oid(900))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.kind, FilterKind::Extension);
        assert_eq!(catalogs.filter.count_filters().await.unwrap(), 1);
    }
}
