//! Indexes of source tables and the constraints attached to them.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::CopyDbResult;
use crate::types::Oid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIndex {
    pub oid: Oid,
    pub qname: String,
    pub nspname: String,
    pub relname: String,
    pub restore_list_name: String,
    pub table_oid: Oid,
    /// Schema of the indexed table, when the table is known to this catalog.
    pub table_nspname: Option<String>,
    pub table_relname: Option<String>,
    pub is_primary: bool,
    pub is_unique: bool,
    pub columns: String,
    /// `CREATE [UNIQUE] INDEX` statement.
    pub sql: String,
    pub constraint: Option<SourceConstraint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConstraint {
    pub oid: Oid,
    pub name: String,
    pub deferrable: bool,
    pub deferred: bool,
    /// Constraint definition, as in `pg_get_constraintdef()`.
    pub sql: String,
}

impl SourceIndex {
    /// Whether the index is built by `CREATE INDEX`.
    ///
    /// Indexes backing a constraint other than a primary key or unique constraint (exclusion
    /// constraints) are created by their `ALTER TABLE ... ADD CONSTRAINT` instead.
    pub fn is_buildable(&self) -> bool {
        self.constraint.is_none() || self.is_primary || self.is_unique
    }

    /// Whether the constraint reuses the built index with `USING INDEX`.
    pub fn constraint_uses_index(&self) -> bool {
        self.constraint.is_some() && (self.is_primary || self.is_unique)
    }

    /// Quoted name of the indexed table.
    pub fn table_qname(&self) -> Option<String> {
        let nspname = self.table_nspname.as_deref()?;
        let relname = self.table_relname.as_deref()?;

        Some(format!(
            "{}.{}",
            pg_escape::quote_identifier(nspname),
            pg_escape::quote_identifier(relname)
        ))
    }
}

impl Catalog {
    /// Adds an index and, when present, its constraint.
    pub async fn add_index(&self, index: &SourceIndex) -> CopyDbResult<()> {
        self.run(Statement::IndexInsert, |pool| async move {
            sqlx::query(Statement::IndexInsert.sql())
                .bind(index.oid)
                .bind(&index.qname)
                .bind(&index.nspname)
                .bind(&index.relname)
                .bind(&index.restore_list_name)
                .bind(index.table_oid)
                .bind(index.is_primary)
                .bind(index.is_unique)
                .bind(&index.columns)
                .bind(&index.sql)
                .execute(&pool)
                .await
        })
        .await?;

        if let Some(constraint) = &index.constraint {
            self.add_constraint(index.oid, constraint).await?;
        }

        Ok(())
    }

    pub async fn add_constraint(
        &self,
        index_oid: Oid,
        constraint: &SourceConstraint,
    ) -> CopyDbResult<()> {
        self.run(Statement::ConstraintInsert, |pool| async move {
            sqlx::query(Statement::ConstraintInsert.sql())
                .bind(constraint.oid)
                .bind(&constraint.name)
                .bind(index_oid)
                .bind(constraint.deferrable)
                .bind(constraint.deferred)
                .bind(&constraint.sql)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_index_by_oid(&self, oid: Oid) -> CopyDbResult<Option<SourceIndex>> {
        let row = self
            .run_locked(Statement::IndexSelectByOid, |pool| async move {
                sqlx::query(Statement::IndexSelectByOid.sql())
                    .bind(oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.as_ref().map(index_from_row))
    }

    pub async fn lookup_index_by_name(
        &self,
        nspname: &str,
        relname: &str,
    ) -> CopyDbResult<Option<SourceIndex>> {
        let row = self
            .run_locked(Statement::IndexSelectByName, |pool| async move {
                sqlx::query(Statement::IndexSelectByName.sql())
                    .bind(nspname)
                    .bind(relname)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.as_ref().map(index_from_row))
    }

    /// Oid of the index-backed constraint `conname` in schema `nspname`.
    pub async fn lookup_constraint_by_name(
        &self,
        nspname: &str,
        conname: &str,
    ) -> CopyDbResult<Option<Oid>> {
        self.run(Statement::ConstraintSelectByName, |pool| async move {
            sqlx::query_scalar(Statement::ConstraintSelectByName.sql())
                .bind(nspname)
                .bind(conname)
                .fetch_optional(&pool)
                .await
        })
        .await
    }

    pub async fn indexes(&self) -> CopyDbResult<Vec<SourceIndex>> {
        let rows = self
            .run(Statement::IndexSelectAll, |pool| async move {
                sqlx::query(Statement::IndexSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows.iter().map(index_from_row).collect())
    }

    pub async fn table_indexes(&self, table_oid: Oid) -> CopyDbResult<Vec<SourceIndex>> {
        let rows = self
            .run(Statement::IndexSelectByTable, |pool| async move {
                sqlx::query(Statement::IndexSelectByTable.sql())
                    .bind(table_oid)
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows.iter().map(index_from_row).collect())
    }

    /// Indexes with an unfinished summary row whose worker is still registered.
    pub async fn indexes_in_progress(&self) -> CopyDbResult<Vec<SourceIndex>> {
        let rows = self
            .run(Statement::IndexSelectInProgress, |pool| async move {
                sqlx::query(Statement::IndexSelectInProgress.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows.iter().map(index_from_row).collect())
    }

    pub async fn count_indexes(&self) -> CopyDbResult<u64> {
        let count: i64 = self
            .run(Statement::IndexCount, |pool| async move {
                sqlx::query_scalar(Statement::IndexCount.sql())
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(count as u64)
    }

    /// Number of indexes of `table_oid` built with `CREATE INDEX`.
    pub async fn count_buildable_indexes(&self, table_oid: Oid) -> CopyDbResult<u64> {
        let count: i64 = self
            .run(Statement::IndexCountBuildable, |pool| async move {
                sqlx::query_scalar(Statement::IndexCountBuildable.sql())
                    .bind(table_oid)
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(count as u64)
    }
}

fn index_from_row(row: &SqliteRow) -> SourceIndex {
    let conoid: Option<Oid> = row.get("conoid");

    let constraint = conoid.filter(|oid| oid.is_valid()).map(|oid| SourceConstraint {
        oid,
        name: row.get::<Option<String>, _>("conname").unwrap_or_default(),
        deferrable: row.get::<Option<bool>, _>("condeferrable").unwrap_or(false),
        deferred: row.get::<Option<bool>, _>("condeferred").unwrap_or(false),
        sql: row.get::<Option<String>, _>("consql").unwrap_or_default(),
    });

    SourceIndex {
        oid: row.get("oid"),
        qname: row.get("qname"),
        nspname: row.get("nspname"),
        relname: row.get("relname"),
        restore_list_name: row.get("restore_list_name"),
        table_oid: row.get("tableoid"),
        table_nspname: row.get("table_nspname"),
        table_relname: row.get("table_relname"),
        is_primary: row.get("isprimary"),
        is_unique: row.get("isunique"),
        columns: row.get("columns"),
        sql: row.get("sql"),
        constraint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;

    fn index(oid: u32, table_oid: u32, relname: &str) -> SourceIndex {
        SourceIndex {
            oid: Oid(oid),
            qname: format!("public.{relname}"),
            nspname: "public".to_string(),
            relname: relname.to_string(),
            restore_list_name: format!("public {relname} postgres"),
            table_oid: Oid(table_oid),
            table_nspname: None,
            table_relname: None,
            is_primary: false,
            is_unique: false,
            columns: "id".to_string(),
            sql: format!("CREATE INDEX {relname} ON public.t USING btree (id)"),
            constraint: None,
        }
    }

    #[test]
    fn exclusion_constraint_indexes_are_not_built_directly() {
        let mut plain = index(1, 10, "plain");
        assert!(plain.is_buildable());
        assert!(!plain.constraint_uses_index());

        plain.constraint = Some(SourceConstraint {
            oid: Oid(2),
            name: "no_overlap".to_string(),
            deferrable: false,
            deferred: false,
            sql: "EXCLUDE USING gist (during WITH &&)".to_string(),
        });
        assert!(!plain.is_buildable());

        plain.is_unique = true;
        assert!(plain.is_buildable());
        assert!(plain.constraint_uses_index());
    }

    #[tokio::test]
    async fn constraints_are_joined_to_their_index() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let mut pkey = index(20, 10, "t_pkey");
        pkey.is_primary = true;
        pkey.is_unique = true;
        pkey.constraint = Some(SourceConstraint {
            oid: Oid(21),
            name: "t_pkey".to_string(),
            deferrable: false,
            deferred: false,
            sql: "PRIMARY KEY (id)".to_string(),
        });
        catalog.add_index(&pkey).await.unwrap();
        catalog.add_index(&index(22, 10, "t_name")).await.unwrap();
        catalog.add_index(&index(30, 11, "u_name")).await.unwrap();

        let found = catalog.lookup_index_by_oid(Oid(20)).await.unwrap().unwrap();
        assert_eq!(found.constraint, pkey.constraint);

        let found = catalog
            .lookup_index_by_name("public", "t_name")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.constraint, None);

        assert_eq!(catalog.table_indexes(Oid(10)).await.unwrap().len(), 2);
        assert_eq!(catalog.count_indexes().await.unwrap(), 3);
        assert_eq!(
            catalog
                .lookup_constraint_by_name("public", "t_pkey")
                .await
                .unwrap(),
            Some(Oid(21))
        );
        assert_eq!(catalog.count_buildable_indexes(Oid(10)).await.unwrap(), 2);
        assert!(catalog.indexes_in_progress().await.unwrap().is_empty());
    }
}
