//! The sentinel: control point between the receiving, applying and operating sides of the
//! replay phase.
//!
//! ```text
//! NotConfigured -> Configured (apply = false) -> Applying -> CaughtUp
//! ```
//!
//! `CaughtUp` is terminal: once `replay_lsn` reaches a valid `endpos` the applier stops.

use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::debug;

use crate::catalog::sql::Statement;
use crate::catalog::store::{Catalog, CatalogTransaction};
use crate::error::CopyDbResult;
use crate::types::{PgLsn, is_valid_lsn, parse_stored_lsn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SentinelState {
    NotConfigured,
    Configured,
    Applying,
    CaughtUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentinel {
    pub startpos: PgLsn,
    pub endpos: PgLsn,
    pub apply: bool,
    /// Last position written by the receiver.
    pub write_lsn: PgLsn,
    /// Last position flushed by the receiver.
    pub flush_lsn: PgLsn,
    /// Last position made durable on the target by the applier.
    pub replay_lsn: PgLsn,
}

impl Sentinel {
    pub fn endpos_reached(&self) -> bool {
        is_valid_lsn(self.endpos) && self.replay_lsn >= self.endpos
    }

    pub fn state(&self) -> SentinelState {
        if self.endpos_reached() {
            SentinelState::CaughtUp
        } else if self.apply {
            SentinelState::Applying
        } else {
            SentinelState::Configured
        }
    }

    /// State of an optional sentinel row.
    pub fn state_of(sentinel: Option<&Sentinel>) -> SentinelState {
        sentinel.map_or(SentinelState::NotConfigured, Sentinel::state)
    }
}

impl Catalog {
    /// Creates (or resets) the sentinel with `apply` off.
    pub async fn setup_sentinel(&self, startpos: PgLsn, endpos: PgLsn) -> CopyDbResult<()> {
        let startpos = startpos.to_string();
        let startpos = startpos.as_str();
        let endpos = endpos.to_string();
        let endpos = endpos.as_str();

        self.run_locked(Statement::SentinelSetup, |pool| async move {
            sqlx::query(Statement::SentinelSetup.sql())
                .bind(startpos)
                .bind(endpos)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    /// The sentinel, `None` when replication was never configured.
    pub async fn sentinel(&self) -> CopyDbResult<Option<Sentinel>> {
        let row = self
            .run_locked(Statement::SentinelSelect, |pool| async move {
                sqlx::query(Statement::SentinelSelect.sql())
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        row.as_ref().map(sentinel_from_row).transpose()
    }

    pub async fn update_sentinel_apply(&self, apply: bool) -> CopyDbResult<()> {
        self.run_locked(Statement::SentinelUpdateApply, |pool| async move {
            sqlx::query(Statement::SentinelUpdateApply.sql())
                .bind(apply)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn update_sentinel_startpos(&self, startpos: PgLsn) -> CopyDbResult<()> {
        self.update_sentinel_position(Statement::SentinelUpdateStartpos, startpos)
            .await
    }

    pub async fn update_sentinel_endpos(&self, endpos: PgLsn) -> CopyDbResult<()> {
        self.update_sentinel_position(Statement::SentinelUpdateEndpos, endpos)
            .await
    }

    /// Records the receiver progress and returns the sentinel as it is after the update.
    ///
    /// The flushed position also becomes the new `startpos`, from which streaming restarts.
    pub async fn sync_recv(&self, write_lsn: PgLsn, flush_lsn: PgLsn) -> CopyDbResult<Sentinel> {
        let write_lsn = write_lsn.to_string();
        let flush_lsn = flush_lsn.to_string();

        let _permit = self.lock().await?;
        let mut tx = self.begin().await?;
        tx.update_sentinel(
            Statement::SentinelSyncRecv,
            &[flush_lsn.as_str(), write_lsn.as_str(), flush_lsn.as_str()],
        )
        .await?;
        let sentinel = tx.select_sentinel().await?;
        tx.commit().await?;

        debug!(%write_lsn, %flush_lsn, "synced receiver position");

        Ok(sentinel)
    }

    /// Records the applier progress and returns the sentinel as it is after the update.
    pub async fn sync_apply(&self, replay_lsn: PgLsn) -> CopyDbResult<Sentinel> {
        let replay_lsn = replay_lsn.to_string();

        let _permit = self.lock().await?;
        let mut tx = self.begin().await?;
        tx.update_sentinel(Statement::SentinelSyncApply, &[replay_lsn.as_str()])
            .await?;
        let sentinel = tx.select_sentinel().await?;
        tx.commit().await?;

        debug!(%replay_lsn, "synced applier position");

        Ok(sentinel)
    }

    async fn update_sentinel_position(&self, statement: Statement, lsn: PgLsn) -> CopyDbResult<()> {
        let lsn = lsn.to_string();
        let lsn = lsn.as_str();

        self.run_locked(statement, |pool| async move {
            sqlx::query(statement.sql()).bind(lsn).execute(&pool).await
        })
        .await?;

        Ok(())
    }
}

impl CatalogTransaction {
    async fn update_sentinel(&mut self, statement: Statement, lsns: &[&str]) -> CopyDbResult<()> {
        let mut query = sqlx::query(statement.sql());
        for lsn in lsns {
            query = query.bind(*lsn);
        }

        let conn = self.conn()?;
        let result = query.execute(conn).await;

        result
            .map(|_| ())
            .map_err(|err| self.statement_error(statement, err))
    }

    async fn select_sentinel(&mut self) -> CopyDbResult<Sentinel> {
        let conn = self.conn()?;
        let result = sqlx::query(Statement::SentinelSelect.sql())
            .fetch_one(conn)
            .await;

        match result {
            Ok(row) => sentinel_from_row(&row),
            Err(err) => Err(self.statement_error(Statement::SentinelSelect, err)),
        }
    }
}

fn sentinel_from_row(row: &SqliteRow) -> CopyDbResult<Sentinel> {
    let lsn = |column: &str| parse_stored_lsn(row.get::<Option<String>, _>(column).as_deref());

    Ok(Sentinel {
        startpos: lsn("startpos")?,
        endpos: lsn("endpos")?,
        apply: row.get("apply"),
        write_lsn: lsn("write_lsn")?,
        flush_lsn: lsn("flush_lsn")?,
        replay_lsn: lsn("replay_lsn")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;
    use crate::types::{invalid_lsn, parse_lsn};

    async fn source_catalog(dir: &tempfile::TempDir) -> Catalog {
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn sentinel_walks_through_its_states() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = source_catalog(&dir).await;

        assert_eq!(
            Sentinel::state_of(catalog.sentinel().await.unwrap().as_ref()),
            SentinelState::NotConfigured
        );

        let startpos = parse_lsn("0/1000").unwrap();
        let endpos = parse_lsn("0/3000").unwrap();
        catalog.setup_sentinel(startpos, invalid_lsn()).await.unwrap();

        let sentinel = catalog.sentinel().await.unwrap().unwrap();
        assert_eq!(sentinel.state(), SentinelState::Configured);
        assert_eq!(sentinel.startpos, startpos);

        catalog.update_sentinel_apply(true).await.unwrap();
        catalog.update_sentinel_endpos(endpos).await.unwrap();

        let sentinel = catalog
            .sync_recv(parse_lsn("0/2800").unwrap(), parse_lsn("0/2000").unwrap())
            .await
            .unwrap();
        assert_eq!(sentinel.state(), SentinelState::Applying);
        assert_eq!(sentinel.startpos, parse_lsn("0/2000").unwrap());
        assert_eq!(sentinel.write_lsn, parse_lsn("0/2800").unwrap());

        let sentinel = catalog.sync_apply(endpos).await.unwrap();
        assert_eq!(sentinel.state(), SentinelState::CaughtUp);
        assert!(sentinel.endpos_reached());
    }

    #[tokio::test]
    async fn invalid_endpos_never_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = source_catalog(&dir).await;

        catalog
            .setup_sentinel(parse_lsn("0/1000").unwrap(), invalid_lsn())
            .await
            .unwrap();
        let sentinel = catalog
            .sync_apply(parse_lsn("FF/0").unwrap())
            .await
            .unwrap();

        assert!(!sentinel.endpos_reached());
    }
}
