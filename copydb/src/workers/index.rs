use tracing::{debug, error, info, warn};

use crate::bail;
use crate::catalog::{ProcessInfo, Section, SourceIndex};
use crate::clients::{Connector, TargetClient};
use crate::concurrency::queue::{QueueMessage, WorkQueue};
use crate::concurrency::shutdown::ShutdownResult;
use crate::context::CopyContext;
use crate::coordination::{ClaimOutcome, WorkUnit};
use crate::error::{CopyDbResult, ErrorKind};
use crate::types::Oid;
use crate::workers::base::WorkerType;
use crate::workers::follow_up::{FollowUpQueues, connected_target, on_index_done};

const CREATE_INDEX_PREFIXES: [&str; 2] = ["CREATE UNIQUE INDEX ", "CREATE INDEX "];
const IF_NOT_EXISTS: &str = "IF NOT EXISTS ";

/// Returns the `CREATE INDEX` statement of `index`, made idempotent when `if_not_exists` is set.
pub fn create_index_sql(index: &SourceIndex, if_not_exists: bool) -> CopyDbResult<String> {
    if !if_not_exists {
        return Ok(index.sql.clone());
    }

    let sql = index.sql.trim_start();
    for prefix in CREATE_INDEX_PREFIXES {
        let Some(head) = sql.get(..prefix.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(prefix) {
            continue;
        }

        let rest = &sql[prefix.len()..];
        if rest
            .get(..IF_NOT_EXISTS.len())
            .is_some_and(|clause| clause.eq_ignore_ascii_case(IF_NOT_EXISTS))
        {
            return Ok(sql.to_owned());
        }

        return Ok(format!("{head}{IF_NOT_EXISTS}{rest}"));
    }

    bail!(
        ErrorKind::InvalidData,
        "Failed to parse the index definition",
        format!("index: {}, sql: {}", index.qname, index.sql)
    );
}

/// Builds the indexes received on the index queue.
pub struct IndexWorker<C: Connector> {
    name: String,
    ctx: CopyContext<C>,
    queue: WorkQueue,
    follow_up: FollowUpQueues,
    target: Option<C::Target>,
}

impl<C: Connector> IndexWorker<C> {
    pub fn new(
        id: usize,
        ctx: CopyContext<C>,
        queue: WorkQueue,
        follow_up: FollowUpQueues,
    ) -> Self {
        Self {
            name: WorkerType::Index.worker_name(id),
            ctx,
            queue,
            follow_up,
            target: None,
        }
    }

    pub async fn run(mut self) -> CopyDbResult<()> {
        let mut errors = Vec::new();
        let mut shutdown_rx = self.ctx.shutdown_rx.clone();

        loop {
            let oid = match self.queue.receive(&mut shutdown_rx).await? {
                ShutdownResult::Ok(QueueMessage::Stop) => break,
                ShutdownResult::Ok(QueueMessage::IndexOid { oid }) => oid,
                ShutdownResult::Ok(message) => {
                    warn!(worker = %self.name, %message, "ignoring unexpected message on the index queue");
                    continue;
                }
                ShutdownResult::Shutdown(_) => {
                    info!(worker = %self.name, "shutting down index worker");
                    break;
                }
            };

            if let Err(err) = self.build_index(oid).await {
                if self.ctx.is_shutdown() {
                    break;
                }

                error!(worker = %self.name, index_id = %oid, error = %err, "index build failed");

                if self.ctx.options.fail_fast {
                    self.clear_process().await;
                    return Err(err);
                }

                errors.push(err);
            }
        }

        self.clear_process().await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn build_index(&mut self, oid: Oid) -> CopyDbResult<()> {
        let Some(index) = self.ctx.source().lookup_index_by_oid(oid).await? else {
            bail!(
                ErrorKind::InvalidData,
                "Index not found in the source catalog",
                format!("index_id: {oid}")
            );
        };

        let unit = WorkUnit::Index {
            table_oid: index.table_oid,
            index_oid: index.oid,
        };
        let sql = create_index_sql(&index, self.ctx.options.if_not_exists())?;

        match self.ctx.coordinator.claim(unit, &sql).await? {
            ClaimOutcome::Claimed(claim) => {
                self.ctx
                    .source()
                    .upsert_process_info(&ProcessInfo {
                        pid: std::process::id(),
                        worker: self.name.clone(),
                        ps_type: "CREATE INDEX".to_owned(),
                        ps_title: index.qname.clone(),
                        table_oid: Some(index.table_oid),
                        partnum: None,
                        index_oid: Some(index.oid),
                    })
                    .await?;

                let target = connected_target(&self.ctx, &mut self.target).await?;
                let result = target.execute(&sql).await;
                if let Err(err) = result {
                    self.target = None;
                    return Err(err);
                }

                self.ctx.coordinator.finish(claim, 0).await?;
                self.ctx
                    .source()
                    .increment_timing(Section::Indexes, 1, 0)
                    .await?;

                info!(worker = %self.name, qname = %index.qname, "index built");
            }
            ClaimOutcome::AlreadyDone => {
                debug!(qname = %index.qname, "index already built");
            }
            ClaimOutcome::ClaimedByOther(claimant) => {
                debug!(qname = %index.qname, pid = claimant.pid, "index is being built by another worker");
                return Ok(());
            }
        }

        on_index_done(&self.ctx, &self.follow_up, index.table_oid, &mut self.target).await?;

        Ok(())
    }

    async fn clear_process(&self) {
        if let Err(err) = self
            .ctx
            .source()
            .delete_process(std::process::id(), &self.name)
            .await
        {
            warn!(worker = %self.name, error = %err, "failed to clear process entry");
        }
    }
}
