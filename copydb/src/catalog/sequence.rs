//! Sequences and the values they are reset to on the target.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::CopyDbResult;
use crate::types::Oid;

/// A sequence, one row per owning column or default expression that references it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSequence {
    pub oid: Oid,
    /// Table owning the sequence through `OWNED BY`, or the invalid oid.
    pub ownedby: Oid,
    /// Table whose column default uses the sequence, or the invalid oid.
    pub attrelid: Oid,
    /// Oid of the column default expression, or the invalid oid.
    pub attroid: Oid,
    pub datname: Option<String>,
    pub qname: String,
    pub nspname: String,
    pub relname: String,
    pub restore_list_name: String,
    pub last_value: i64,
    pub is_called: bool,
}

impl SourceSequence {
    /// `setval()` call restoring the sequence position on the target.
    pub fn setval_sql(&self) -> String {
        format!(
            "select pg_catalog.setval({}, {}, {})",
            pg_escape::quote_literal(&self.qname),
            self.last_value,
            self.is_called
        )
    }
}

impl Catalog {
    /// Adds a sequence row; duplicates of the same relationship are ignored.
    pub async fn add_sequence(&self, sequence: &SourceSequence) -> CopyDbResult<()> {
        self.run(Statement::SequenceInsert, |pool| async move {
            sqlx::query(Statement::SequenceInsert.sql())
                .bind(sequence.oid)
                .bind(sequence.ownedby)
                .bind(sequence.attrelid)
                .bind(sequence.attroid)
                .bind(sequence.datname.as_deref())
                .bind(&sequence.qname)
                .bind(&sequence.nspname)
                .bind(&sequence.relname)
                .bind(&sequence.restore_list_name)
                .bind(sequence.last_value)
                .bind(sequence.is_called)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn update_sequence_values(
        &self,
        oid: Oid,
        last_value: i64,
        is_called: bool,
    ) -> CopyDbResult<()> {
        self.run_locked(Statement::SequenceUpdateValues, |pool| async move {
            sqlx::query(Statement::SequenceUpdateValues.sql())
                .bind(last_value)
                .bind(is_called)
                .bind(oid)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_sequence_by_oid(&self, oid: Oid) -> CopyDbResult<Option<SourceSequence>> {
        let row = self
            .run_locked(Statement::SequenceSelectByOid, |pool| async move {
                sqlx::query(Statement::SequenceSelectByOid.sql())
                    .bind(oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.as_ref().map(sequence_from_row))
    }

    /// Every sequence row.
    pub async fn sequences(&self) -> CopyDbResult<Vec<SourceSequence>> {
        let rows = self
            .run(Statement::SequenceSelectAll, |pool| async move {
                sqlx::query(Statement::SequenceSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows.iter().map(sequence_from_row).collect())
    }
}

fn sequence_from_row(row: &SqliteRow) -> SourceSequence {
    SourceSequence {
        oid: row.get("oid"),
        ownedby: row.get("ownedby"),
        attrelid: row.get("attrelid"),
        attroid: row.get("attroid"),
        datname: row.get("datname"),
        qname: row.get("qname"),
        nspname: row.get("nspname"),
        relname: row.get("relname"),
        restore_list_name: row.get("restore_list_name"),
        last_value: row.get("last_value"),
        is_called: row.get("is_called"),
    }
}
