//! Phase timings and per-table vacuum records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::catalog::section::Section;
use crate::catalog::sql::Statement;
use crate::catalog::store::{Catalog, CatalogTransaction};
use crate::error::CopyDbResult;
use crate::types::Oid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingRecord {
    pub section: Section,
    pub start_time_epoch: Option<i64>,
    pub done_time_epoch: Option<i64>,
    /// Milliseconds.
    pub duration: Option<i64>,
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VacuumRecord {
    pub pid: u32,
    pub start_time_epoch: i64,
    pub done_time_epoch: Option<i64>,
    pub duration: Option<i64>,
}

impl Catalog {
    /// Starts (or restarts) the timing of `section` and resets its counters.
    pub async fn start_timing(&self, section: Section, start: DateTime<Utc>) -> CopyDbResult<()> {
        let name = section.as_str();

        self.run_locked(Statement::TimingStart, |pool| async move {
            sqlx::query(Statement::TimingStart.sql())
                .bind(name)
                .bind(start.timestamp())
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn finish_timing(
        &self,
        section: Section,
        start: DateTime<Utc>,
        done: DateTime<Utc>,
    ) -> CopyDbResult<()> {
        let name = section.as_str();
        let duration = (done - start).num_milliseconds();

        self.run_locked(Statement::TimingDone, |pool| async move {
            sqlx::query(Statement::TimingDone.sql())
                .bind(done.timestamp())
                .bind(duration)
                .bind(name)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    /// Adds `count` units and `bytes` bytes to the counters of `section`.
    pub async fn increment_timing(
        &self,
        section: Section,
        count: u64,
        bytes: u64,
    ) -> CopyDbResult<()> {
        let name = section.as_str();

        self.run_locked(Statement::TimingIncrement, |pool| async move {
            sqlx::query(Statement::TimingIncrement.sql())
                .bind(count as i64)
                .bind(bytes as i64)
                .bind(name)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn timings(&self) -> CopyDbResult<Vec<TimingRecord>> {
        let rows = self
            .run(Statement::TimingSelectAll, |pool| async move {
                sqlx::query(Statement::TimingSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        rows.iter()
            .map(|row| {
                let section: String = row.get("section");
                Ok(TimingRecord {
                    section: section.parse()?,
                    start_time_epoch: row.get("start_time_epoch"),
                    done_time_epoch: row.get("done_time_epoch"),
                    duration: row.get("duration"),
                    count: row.get::<i64, _>("count") as u64,
                    bytes: row.get::<i64, _>("bytes") as u64,
                })
            })
            .collect()
    }

    /// Claims the vacuum of `table_oid` for process `pid`.
    ///
    /// Returns `false` when the table is already vacuumed or `pid` is vacuuming it. A claim
    /// left behind by another process is taken over.
    pub async fn claim_vacuum(
        &self,
        pid: u32,
        table_oid: Oid,
        start: DateTime<Utc>,
    ) -> CopyDbResult<bool> {
        let _permit = self.lock().await?;

        let mut tx = self.begin().await?;
        let claimed = tx
            .vacuum_claimant(table_oid)
            .await?
            .is_some_and(|(owner, done)| done || owner == pid);
        if !claimed {
            tx.insert_vacuum(pid, table_oid, start).await?;
        }
        tx.commit().await?;

        Ok(!claimed)
    }

    pub async fn finish_vacuum(
        &self,
        table_oid: Oid,
        start: DateTime<Utc>,
        done: DateTime<Utc>,
    ) -> CopyDbResult<()> {
        let duration = (done - start).num_milliseconds();

        self.run_locked(Statement::VacuumFinish, |pool| async move {
            sqlx::query(Statement::VacuumFinish.sql())
                .bind(done.timestamp())
                .bind(duration)
                .bind(table_oid)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_vacuum(&self, table_oid: Oid) -> CopyDbResult<Option<VacuumRecord>> {
        let row = self
            .run(Statement::VacuumSelect, |pool| async move {
                sqlx::query(Statement::VacuumSelect.sql())
                    .bind(table_oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.map(|row| VacuumRecord {
            pid: row.get("pid"),
            start_time_epoch: row.get("start_time_epoch"),
            done_time_epoch: row.get("done_time_epoch"),
            duration: row.get("duration"),
        }))
    }
}

impl CatalogTransaction {
    /// Pid of the vacuum claim of `table_oid`, and whether it is done.
    async fn vacuum_claimant(&mut self, table_oid: Oid) -> CopyDbResult<Option<(u32, bool)>> {
        let conn = self.conn()?;
        let result = sqlx::query(Statement::VacuumSelect.sql())
            .bind(table_oid)
            .fetch_optional(conn)
            .await;

        match result {
            Ok(row) => Ok(row.map(|row| {
                let done: Option<i64> = row.get("done_time_epoch");
                (row.get("pid"), done.is_some())
            })),
            Err(err) => Err(self.statement_error(Statement::VacuumSelect, err)),
        }
    }

    async fn insert_vacuum(
        &mut self,
        pid: u32,
        table_oid: Oid,
        start: DateTime<Utc>,
    ) -> CopyDbResult<()> {
        let conn = self.conn()?;
        let result = sqlx::query(Statement::VacuumClaim.sql())
            .bind(pid)
            .bind(table_oid)
            .bind(start.timestamp())
            .execute(conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => Err(self.statement_error(Statement::VacuumClaim, err)),
        }
    }
}
