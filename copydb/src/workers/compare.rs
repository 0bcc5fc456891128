use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bail;
use crate::catalog::{SourceTable, TableChecksum};
use crate::clients::{Connector, SourceClient, TargetClient};
use crate::concurrency::queue::{QueueMessage, WorkQueue};
use crate::concurrency::shutdown::ShutdownResult;
use crate::context::CopyContext;
use crate::error::{CopyDbResult, ErrorKind};
use crate::types::Oid;
use crate::workers::base::WorkerType;
use crate::workers::follow_up::connected_target;
use crate::workers::pool::WorkerPool;

/// Checksums of one table on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableComparison {
    pub oid: Oid,
    pub qname: String,
    pub source: TableChecksum,
    pub target: TableChecksum,
}

impl TableComparison {
    pub fn matches(&self) -> bool {
        self.source == self.target
    }
}

/// Compares the data of every source catalog table with its copy on the target.
///
/// Fails with [`ErrorKind::ChecksumMismatch`] listing the tables whose row count or checksum
/// differ.
pub async fn compare_data<C: Connector>(
    ctx: &CopyContext<C>,
) -> CopyDbResult<Vec<TableComparison>> {
    let tables = ctx.source().tables().await?;
    let jobs = ctx.options.compare_jobs.max(1);
    let queue = WorkQueue::create("compare", ctx.options.queue_capacity);
    let results = Arc::new(Mutex::new(Vec::with_capacity(tables.len())));

    info!(tables = tables.len(), jobs, "comparing table data");

    let mut pool = WorkerPool::new(WorkerType::Compare, ctx.options.fail_fast);
    for id in 1..=jobs {
        let worker = CompareWorker::new(id, ctx.clone(), queue.clone(), results.clone());
        pool.spawn(id, worker.run());
    }

    let producer = {
        let queue = queue.clone();
        let mut shutdown_rx = ctx.shutdown_rx.clone();
        async move {
            for table in &tables {
                let message = QueueMessage::TableOid {
                    oid: table.oid,
                    part: None,
                };
                if queue
                    .send_until_shutdown(message, &mut shutdown_rx)
                    .await?
                    .should_shutdown()
                {
                    return Ok(());
                }
            }

            queue.send_stops(jobs).await
        }
    };
    pool.wait_with_producer(&queue, producer).await?;

    if ctx.is_shutdown() {
        bail!(ErrorKind::InvalidState, "Comparison interrupted by shutdown");
    }

    let mut comparisons = std::mem::take(&mut *results.lock().await);
    comparisons.sort_by(|a: &TableComparison, b| a.qname.cmp(&b.qname));

    let mismatches: Vec<&str> = comparisons
        .iter()
        .filter(|comparison| !comparison.matches())
        .map(|comparison| comparison.qname.as_str())
        .collect();
    if !mismatches.is_empty() {
        bail!(
            ErrorKind::ChecksumMismatch,
            "Source and target data differ",
            format!("tables: {}", mismatches.join(", "))
        );
    }

    info!(tables = comparisons.len(), "table data matches");

    Ok(comparisons)
}

struct CompareWorker<C: Connector> {
    name: String,
    ctx: CopyContext<C>,
    queue: WorkQueue,
    results: Arc<Mutex<Vec<TableComparison>>>,
    source: Option<C::Source>,
    target: Option<C::Target>,
}

impl<C: Connector> CompareWorker<C> {
    fn new(
        id: usize,
        ctx: CopyContext<C>,
        queue: WorkQueue,
        results: Arc<Mutex<Vec<TableComparison>>>,
    ) -> Self {
        Self {
            name: WorkerType::Compare.worker_name(id),
            ctx,
            queue,
            results,
            source: None,
            target: None,
        }
    }

    async fn run(mut self) -> CopyDbResult<()> {
        let mut errors = Vec::new();
        let mut shutdown_rx = self.ctx.shutdown_rx.clone();

        loop {
            let oid = match self.queue.receive(&mut shutdown_rx).await? {
                ShutdownResult::Ok(QueueMessage::Stop) | ShutdownResult::Shutdown(_) => break,
                ShutdownResult::Ok(QueueMessage::TableOid { oid, .. }) => oid,
                ShutdownResult::Ok(message) => {
                    warn!(worker = %self.name, %message, "ignoring unexpected message on the compare queue");
                    continue;
                }
            };

            match self.compare_table(oid).await {
                Ok(comparison) => self.results.lock().await.push(comparison),
                Err(err) => {
                    error!(worker = %self.name, table_id = %oid, error = %err, "table comparison failed");
                    self.source = None;
                    self.target = None;

                    if self.ctx.options.fail_fast {
                        return Err(err);
                    }

                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn compare_table(&mut self, oid: Oid) -> CopyDbResult<TableComparison> {
        let catalog = self.ctx.source();
        let Some(table) = catalog.lookup_table_by_oid(oid).await? else {
            bail!(
                ErrorKind::InvalidData,
                "Table not found in the source catalog",
                format!("table_id: {oid}")
            );
        };

        let (source, target) = self.checksums(&table).await?;

        let catalog = self.ctx.source();
        catalog.add_source_checksum(oid, &source).await?;
        catalog.add_target_checksum(oid, &target).await?;

        let comparison = TableComparison {
            oid,
            qname: table.qname,
            source,
            target,
        };

        if comparison.matches() {
            info!(qname = %comparison.qname, rows = comparison.source.rowcount, "table data matches");
        } else {
            warn!(
                qname = %comparison.qname,
                source_rows = comparison.source.rowcount,
                target_rows = comparison.target.rowcount,
                "table data differs"
            );
        }

        Ok(comparison)
    }

    /// Computes both checksums concurrently.
    async fn checksums(&mut self, table: &SourceTable) -> CopyDbResult<(TableChecksum, TableChecksum)> {
        if self.source.is_none() {
            self.source = Some(self.ctx.connect_source().await?);
        }
        let target = connected_target(&self.ctx, &mut self.target).await?;
        let Some(source) = self.source.as_mut() else {
            bail!(ErrorKind::InvalidState, "Source client is not connected");
        };

        tokio::try_join!(
            source.table_checksum(&table.qname),
            target.table_checksum(&table.qname)
        )
    }
}
