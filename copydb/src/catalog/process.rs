//! Registry of the workers currently running a unit of work.

use serde::Serialize;
use sqlx::Row;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::CopyDbResult;
use crate::types::Oid;

/// What a worker is doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Name of the worker task within the process, such as `table-copy-2`.
    pub worker: String,
    pub ps_type: String,
    pub ps_title: String,
    pub table_oid: Option<Oid>,
    pub partnum: Option<u32>,
    pub index_oid: Option<Oid>,
}

impl Catalog {
    pub async fn upsert_process_info(&self, info: &ProcessInfo) -> CopyDbResult<()> {
        self.run_locked(Statement::ProcessUpsert, |pool| async move {
            sqlx::query(Statement::ProcessUpsert.sql())
                .bind(info.pid)
                .bind(&info.worker)
                .bind(&info.ps_type)
                .bind(&info.ps_title)
                .bind(info.table_oid)
                .bind(info.partnum)
                .bind(info.index_oid)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn delete_process(&self, pid: u32, worker: &str) -> CopyDbResult<()> {
        self.run_locked(Statement::ProcessDelete, |pool| async move {
            sqlx::query(Statement::ProcessDelete.sql())
                .bind(pid)
                .bind(worker)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    /// Removes every worker of `pid`, used when a run starts over after a crash.
    pub async fn delete_processes(&self, pid: u32) -> CopyDbResult<u64> {
        let result = self
            .run_locked(Statement::ProcessDeleteByPid, |pool| async move {
                sqlx::query(Statement::ProcessDeleteByPid.sql())
                    .bind(pid)
                    .execute(&pool)
                    .await
            })
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn processes(&self) -> CopyDbResult<Vec<ProcessInfo>> {
        let rows = self
            .run(Statement::ProcessSelectAll, |pool| async move {
                sqlx::query(Statement::ProcessSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| ProcessInfo {
                pid: row.get("pid"),
                worker: row.get("worker"),
                ps_type: row.get("ps_type"),
                ps_title: row.get("ps_title"),
                table_oid: row.get("tableoid"),
                partnum: row.get("partnum"),
                index_oid: row.get("indexoid"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;

    #[tokio::test]
    async fn workers_of_one_process_are_tracked_separately() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let mut info = ProcessInfo {
            pid: 4242,
            worker: "table-copy-0".to_string(),
            ps_type: "COPY".to_string(),
            ps_title: "copy public.users".to_string(),
            table_oid: Some(Oid(16_384)),
            partnum: Some(0),
            index_oid: None,
        };
        catalog.upsert_process_info(&info).await.unwrap();

        info.worker = "table-copy-1".to_string();
        catalog.upsert_process_info(&info).await.unwrap();

        info.ps_title = "copy public.events".to_string();
        info.table_oid = Some(Oid(16_390));
        catalog.upsert_process_info(&info).await.unwrap();

        let processes = catalog.processes().await.unwrap();
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[1].table_oid, Some(Oid(16_390)));

        catalog.delete_process(4242, "table-copy-0").await.unwrap();
        assert_eq!(catalog.processes().await.unwrap().len(), 1);
        assert_eq!(catalog.delete_processes(4242).await.unwrap(), 1);
    }
}
