use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bail;
use crate::catalog::{ProcessInfo, Section};
use crate::clients::{Connector, TargetClient};
use crate::concurrency::queue::{QueueMessage, WorkQueue};
use crate::concurrency::shutdown::ShutdownResult;
use crate::context::CopyContext;
use crate::error::{CopyDbResult, ErrorKind};
use crate::types::Oid;
use crate::workers::base::WorkerType;
use crate::workers::follow_up::connected_target;

/// Runs `VACUUM ANALYZE` on the target for the tables received on the vacuum queue.
pub struct VacuumWorker<C: Connector> {
    name: String,
    ctx: CopyContext<C>,
    queue: WorkQueue,
    target: Option<C::Target>,
}

impl<C: Connector> VacuumWorker<C> {
    pub fn new(id: usize, ctx: CopyContext<C>, queue: WorkQueue) -> Self {
        Self {
            name: WorkerType::Vacuum.worker_name(id),
            ctx,
            queue,
            target: None,
        }
    }

    pub async fn run(mut self) -> CopyDbResult<()> {
        let mut errors = Vec::new();
        let mut shutdown_rx = self.ctx.shutdown_rx.clone();

        loop {
            let oid = match self.queue.receive(&mut shutdown_rx).await? {
                ShutdownResult::Ok(QueueMessage::Stop) => break,
                ShutdownResult::Ok(QueueMessage::TableOid { oid, .. }) => oid,
                ShutdownResult::Ok(message) => {
                    warn!(worker = %self.name, %message, "ignoring unexpected message on the vacuum queue");
                    continue;
                }
                ShutdownResult::Shutdown(_) => break,
            };

            if let Err(err) = self.vacuum_table(oid).await {
                if self.ctx.is_shutdown() {
                    break;
                }

                error!(worker = %self.name, table_id = %oid, error = %err, "vacuum failed");

                if self.ctx.options.fail_fast {
                    return Err(err);
                }

                errors.push(err);
            }
        }

        if let Err(err) = self
            .ctx
            .source()
            .delete_process(std::process::id(), &self.name)
            .await
        {
            warn!(worker = %self.name, error = %err, "failed to clear process entry");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn vacuum_table(&mut self, oid: Oid) -> CopyDbResult<()> {
        let catalog = self.ctx.source();

        let Some(table) = catalog.lookup_table_by_oid(oid).await? else {
            bail!(
                ErrorKind::InvalidData,
                "Table not found in the source catalog",
                format!("table_id: {oid}")
            );
        };

        let start = Utc::now();
        if !catalog.claim_vacuum(std::process::id(), oid, start).await? {
            debug!(qname = %table.qname, "table already vacuumed");
            return Ok(());
        }

        catalog
            .upsert_process_info(&ProcessInfo {
                pid: std::process::id(),
                worker: self.name.clone(),
                ps_type: "VACUUM".to_owned(),
                ps_title: table.qname.clone(),
                table_oid: Some(oid),
                partnum: None,
                index_oid: None,
            })
            .await?;

        let sql = format!("vacuum analyze {}", table.qname);
        let target = connected_target(&self.ctx, &mut self.target).await?;
        let result = target.execute(&sql).await;
        if let Err(err) = result {
            self.target = None;
            return Err(err);
        }

        let catalog = self.ctx.source();
        catalog.finish_vacuum(oid, start, Utc::now()).await?;
        catalog.increment_timing(Section::Vacuum, 1, 0).await?;

        info!(worker = %self.name, qname = %table.qname, "table vacuumed");

        Ok(())
    }
}
