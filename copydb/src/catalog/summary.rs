//! Claim and completion rows of the work units, and the completion registries that elect the
//! single follow-up winner of a table.
//!
//! The claim protocol runs these inside one immediate transaction while holding the catalog
//! semaphore, so they live on [`CatalogTransaction`]. Read-only reporting goes through
//! [`Catalog`].

use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::catalog::sql::Statement;
use crate::catalog::store::{Catalog, CatalogTransaction};
use crate::coordination::unit::WorkUnit;
use crate::error::CopyDbResult;
use crate::types::{Claimant, Oid};

/// A `summary` row: a claim while `done_time_epoch` is unset, a completion afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRecord {
    pub claimant: Claimant,
    pub table_oid: Oid,
    pub partnum: Option<u32>,
    pub index_oid: Option<Oid>,
    pub constraint_oid: Option<Oid>,
    pub start_time_epoch: i64,
    pub done_time_epoch: Option<i64>,
    /// Milliseconds.
    pub duration: Option<i64>,
    pub bytes: Option<u64>,
    pub command: Option<String>,
}

impl SummaryRecord {
    pub fn is_done(&self) -> bool {
        self.done_time_epoch.is_some()
    }
}

/// Completed units, as counted for the progress report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub table_parts: u64,
    pub indexes: u64,
    pub constraints: u64,
    pub bytes: u64,
}

/// Which completion registry of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionGate {
    /// Every part of the table is copied; the winner enqueues the index builds.
    PartsDone,
    /// Every index of the table is built; the winner builds the constraints and enqueues
    /// vacuum.
    IndexesDone,
}

impl CompletionGate {
    fn insert(self) -> Statement {
        match self {
            CompletionGate::PartsDone => Statement::PartsDoneInsert,
            CompletionGate::IndexesDone => Statement::IndexesDoneInsert,
        }
    }

    fn select(self) -> Statement {
        match self {
            CompletionGate::PartsDone => Statement::PartsDoneSelect,
            CompletionGate::IndexesDone => Statement::IndexesDoneSelect,
        }
    }
}

impl CatalogTransaction {
    /// Writes the claim row of `unit`, replacing the row of a previous claimant.
    pub async fn claim_summary(
        &mut self,
        unit: &WorkUnit,
        claimant: &Claimant,
        start_time_epoch: i64,
        command: &str,
    ) -> CopyDbResult<()> {
        let token = claimant.token.to_string();
        let (statement, object) = match *unit {
            WorkUnit::TablePart { partnum, .. } => (Statement::SummaryClaimTablePart, partnum),
            WorkUnit::Index { index_oid, .. } => {
                (Statement::SummaryClaimIndex, index_oid.into_inner())
            }
            WorkUnit::Constraint { constraint_oid, .. } => {
                (Statement::SummaryClaimConstraint, constraint_oid.into_inner())
            }
        };

        let conn = self.conn()?;
        let result = sqlx::query(statement.sql())
            .bind(claimant.pid)
            .bind(&token)
            .bind(unit.table_oid())
            .bind(object)
            .bind(start_time_epoch)
            .bind(command)
            .execute(conn)
            .await;

        result
            .map(|_| ())
            .map_err(|err| self.statement_error(statement, err))
    }

    /// Turns the claim row of `unit` into its completion row.
    pub async fn finish_summary(
        &mut self,
        unit: &WorkUnit,
        done_time_epoch: i64,
        duration_ms: i64,
        bytes: u64,
    ) -> CopyDbResult<()> {
        let statement = match unit {
            WorkUnit::TablePart { .. } => Statement::SummaryFinishTablePart,
            WorkUnit::Index { .. } => Statement::SummaryFinishIndex,
            WorkUnit::Constraint { .. } => Statement::SummaryFinishConstraint,
        };

        let conn = self.conn()?;
        let query = sqlx::query(statement.sql())
            .bind(done_time_epoch)
            .bind(duration_ms)
            .bind(bytes as i64);
        let query = match *unit {
            WorkUnit::TablePart { table_oid, partnum } => query.bind(table_oid).bind(partnum),
            WorkUnit::Index { index_oid, .. } => query.bind(index_oid),
            WorkUnit::Constraint { constraint_oid, .. } => query.bind(constraint_oid),
        };
        let result = query.execute(conn).await;

        result
            .map(|_| ())
            .map_err(|err| self.statement_error(statement, err))
    }

    /// Removes the row of `unit`, used when recovering the claim of a dead claimant.
    pub async fn delete_summary(&mut self, unit: &WorkUnit) -> CopyDbResult<()> {
        let statement = match unit {
            WorkUnit::TablePart { .. } => Statement::SummaryDeleteTablePart,
            WorkUnit::Index { .. } => Statement::SummaryDeleteIndex,
            WorkUnit::Constraint { .. } => Statement::SummaryDeleteConstraint,
        };

        let conn = self.conn()?;
        let result = unit_query(statement, unit).execute(conn).await;

        result
            .map(|_| ())
            .map_err(|err| self.statement_error(statement, err))
    }

    pub async fn lookup_summary(&mut self, unit: &WorkUnit) -> CopyDbResult<Option<SummaryRecord>> {
        let statement = select_statement(unit);

        let conn = self.conn()?;
        let result = unit_query(statement, unit).fetch_optional(conn).await;

        match result {
            Ok(row) => row.as_ref().map(summary_from_row).transpose(),
            Err(err) => Err(self.statement_error(statement, err)),
        }
    }

    /// Records `claimant` as the winner of `gate` for `table_oid`.
    ///
    /// Returns `true` only for the first caller; later callers find the existing row.
    pub async fn register_completion(
        &mut self,
        gate: CompletionGate,
        table_oid: Oid,
        claimant: &Claimant,
    ) -> CopyDbResult<bool> {
        let statement = gate.insert();
        let token = claimant.token.to_string();

        let conn = self.conn()?;
        let result = sqlx::query(statement.sql())
            .bind(table_oid)
            .bind(claimant.pid)
            .bind(&token)
            .execute(conn)
            .await;

        match result {
            Ok(result) => Ok(result.rows_affected() == 1),
            Err(err) => Err(self.statement_error(statement, err)),
        }
    }

    pub async fn lookup_completion(
        &mut self,
        gate: CompletionGate,
        table_oid: Oid,
    ) -> CopyDbResult<Option<Claimant>> {
        let statement = gate.select();

        let conn = self.conn()?;
        let result = sqlx::query(statement.sql())
            .bind(table_oid)
            .fetch_optional(conn)
            .await;

        match result {
            Ok(Some(row)) => Ok(Some(claimant_from_row(&row)?)),
            Ok(None) => Ok(None),
            Err(err) => Err(self.statement_error(statement, err)),
        }
    }
}

impl Catalog {
    /// Row of `unit`, outside of the claim protocol.
    pub async fn lookup_summary(&self, unit: &WorkUnit) -> CopyDbResult<Option<SummaryRecord>> {
        let statement = select_statement(unit);

        let row = self
            .run_locked(statement, |pool| async move {
                unit_query(statement, unit).fetch_optional(&pool).await
            })
            .await?;

        row.as_ref().map(summary_from_row).transpose()
    }

    pub async fn lookup_completion(
        &self,
        gate: CompletionGate,
        table_oid: Oid,
    ) -> CopyDbResult<Option<Claimant>> {
        let statement = gate.select();

        let row = self
            .run(statement, |pool| async move {
                sqlx::query(statement.sql())
                    .bind(table_oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        row.as_ref().map(claimant_from_row).transpose()
    }

    /// Tables whose indexes-done winner was already elected.
    pub async fn tables_with_indexes_done(&self) -> CopyDbResult<Vec<Oid>> {
        self.run(Statement::IndexesDoneSelectAll, |pool| async move {
            sqlx::query_scalar(Statement::IndexesDoneSelectAll.sql())
                .fetch_all(&pool)
                .await
        })
        .await
    }

    pub async fn count_summary_done(&self) -> CopyDbResult<SummaryCounts> {
        let row = self
            .run(Statement::SummaryCountDone, |pool| async move {
                sqlx::query(Statement::SummaryCountDone.sql())
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(SummaryCounts {
            table_parts: row.get::<i64, _>(0) as u64,
            indexes: row.get::<i64, _>(1) as u64,
            constraints: row.get::<i64, _>(2) as u64,
            bytes: row.get::<i64, _>(3) as u64,
        })
    }

    /// Bytes copied so far into `table_oid`, over all its finished parts.
    pub async fn table_bytes_copied(&self, table_oid: Oid) -> CopyDbResult<u64> {
        let bytes: i64 = self
            .run(Statement::SummarySelectTableBytes, |pool| async move {
                sqlx::query_scalar(Statement::SummarySelectTableBytes.sql())
                    .bind(table_oid)
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(bytes as u64)
    }
}

fn select_statement(unit: &WorkUnit) -> Statement {
    match unit {
        WorkUnit::TablePart { .. } => Statement::SummarySelectTablePart,
        WorkUnit::Index { .. } => Statement::SummarySelectIndex,
        WorkUnit::Constraint { .. } => Statement::SummarySelectConstraint,
    }
}

/// `statement` with the key of `unit` bound, for statements keyed by the unit only.
fn unit_query(
    statement: Statement,
    unit: &WorkUnit,
) -> sqlx::query::Query<'static, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'static>> {
    let query = sqlx::query(statement.sql());

    match *unit {
        WorkUnit::TablePart { table_oid, partnum } => query.bind(table_oid).bind(partnum),
        WorkUnit::Index { index_oid, .. } => query.bind(index_oid),
        WorkUnit::Constraint { constraint_oid, .. } => query.bind(constraint_oid),
    }
}

fn claimant_from_row(row: &SqliteRow) -> CopyDbResult<Claimant> {
    let token: String = row.get("token");

    Ok(Claimant {
        pid: row.get("pid"),
        token: Uuid::parse_str(&token)?,
    })
}

fn summary_from_row(row: &SqliteRow) -> CopyDbResult<SummaryRecord> {
    Ok(SummaryRecord {
        claimant: claimant_from_row(row)?,
        table_oid: row.get("tableoid"),
        partnum: row.get("partnum"),
        index_oid: row.get("indexoid"),
        constraint_oid: row.get("conoid"),
        start_time_epoch: row.get("start_time_epoch"),
        done_time_epoch: row.get("done_time_epoch"),
        duration: row.get("duration"),
        bytes: row.get::<Option<i64>, _>("bytes").map(|bytes| bytes as u64),
        command: row.get("command"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;

    async fn source_catalog(dir: &tempfile::TempDir) -> Catalog {
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn claims_become_completions() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = source_catalog(&dir).await;
        let unit = WorkUnit::TablePart {
            table_oid: Oid(10),
            partnum: 2,
        };
        let claimant = Claimant::current();

        let mut tx = catalog.begin().await.unwrap();
        assert!(tx.lookup_summary(&unit).await.unwrap().is_none());
        tx.claim_summary(&unit, &claimant, 1_700_000_000, "COPY public.t")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let claim = catalog.lookup_summary(&unit).await.unwrap().unwrap();
        assert_eq!(claim.claimant, claimant);
        assert_eq!(claim.partnum, Some(2));
        assert!(!claim.is_done());

        let mut tx = catalog.begin().await.unwrap();
        tx.finish_summary(&unit, 1_700_000_003, 3_000, 8_192)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let done = catalog.lookup_summary(&unit).await.unwrap().unwrap();
        assert!(done.is_done());
        assert_eq!(done.bytes, Some(8_192));

        let counts = catalog.count_summary_done().await.unwrap();
        assert_eq!(counts.table_parts, 1);
        assert_eq!(counts.bytes, 8_192);
        assert_eq!(catalog.table_bytes_copied(Oid(10)).await.unwrap(), 8_192);
    }

    #[tokio::test]
    async fn reclaiming_replaces_the_previous_row() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = source_catalog(&dir).await;
        let unit = WorkUnit::Index {
            table_oid: Oid(10),
            index_oid: Oid(11),
        };
        let first = Claimant::current();
        let second = Claimant::current();

        let mut tx = catalog.begin().await.unwrap();
        tx.claim_summary(&unit, &first, 1, "CREATE INDEX").await.unwrap();
        tx.claim_summary(&unit, &second, 2, "CREATE INDEX").await.unwrap();
        let row = tx.lookup_summary(&unit).await.unwrap().unwrap();
        assert_eq!(row.claimant, second);

        tx.delete_summary(&unit).await.unwrap();
        assert!(tx.lookup_summary(&unit).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn only_the_first_registration_wins() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = source_catalog(&dir).await;
        let winner = Claimant::current();

        let mut tx = catalog.begin().await.unwrap();
        assert!(
            tx.register_completion(CompletionGate::PartsDone, Oid(10), &winner)
                .await
                .unwrap()
        );
        assert!(
            !tx.register_completion(CompletionGate::PartsDone, Oid(10), &Claimant::current())
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();

        assert_eq!(
            catalog
                .lookup_completion(CompletionGate::PartsDone, Oid(10))
                .await
                .unwrap(),
            Some(winner)
        );
        assert!(
            catalog
                .lookup_completion(CompletionGate::IndexesDone, Oid(10))
                .await
                .unwrap()
                .is_none()
        );
        assert!(catalog.tables_with_indexes_done().await.unwrap().is_empty());
    }
}
