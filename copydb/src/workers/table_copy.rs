use tracing::{debug, error, info, warn};

use crate::bail;
use crate::catalog::{ProcessInfo, Section, SourceTable, TablePart};
use crate::clients::{Connector, CopySpec, TargetClient};
use crate::concurrency::queue::{QueueMessage, WorkQueue};
use crate::concurrency::shutdown::ShutdownResult;
use crate::context::CopyContext;
use crate::coordination::{ClaimOutcome, WorkUnit};
use crate::error::{CopyDbResult, ErrorKind};
use crate::failpoints::{TABLE_COPY_BEFORE_COPY, copydb_fail_point};
use crate::types::Oid;
use crate::workers::base::WorkerType;
use crate::workers::follow_up::{FollowUpQueues, connected_target, on_table_part_done};

/// Copies the tables and table parts received on the table queue.
///
/// Source and target connections are kept across units and dropped after a failure.
pub struct TableCopyWorker<C: Connector> {
    id: usize,
    name: String,
    ctx: CopyContext<C>,
    queue: WorkQueue,
    follow_up: FollowUpQueues,
    source: Option<C::Source>,
    target: Option<C::Target>,
}

impl<C: Connector> TableCopyWorker<C> {
    pub fn new(
        id: usize,
        ctx: CopyContext<C>,
        queue: WorkQueue,
        follow_up: FollowUpQueues,
    ) -> Self {
        Self {
            id,
            name: WorkerType::TableCopy.worker_name(id),
            ctx,
            queue,
            follow_up,
            source: None,
            target: None,
        }
    }

    /// Processes messages until STOP or shutdown.
    ///
    /// Without fail-fast a failing unit is logged and the worker moves on; the errors are
    /// returned once the queue is drained.
    pub async fn run(mut self) -> CopyDbResult<()> {
        let mut errors = Vec::new();
        let mut shutdown_rx = self.ctx.shutdown_rx.clone();

        loop {
            let message = match self.queue.receive(&mut shutdown_rx).await? {
                ShutdownResult::Ok(message) => message,
                ShutdownResult::Shutdown(_) => {
                    info!(worker = %self.name, "shutting down table copy worker");
                    break;
                }
            };

            let (oid, part) = match message {
                QueueMessage::Stop => break,
                QueueMessage::TableOid { oid, part } => (oid, part),
                QueueMessage::IndexOid { oid } => {
                    warn!(worker = %self.name, index_id = %oid, "ignoring index message on the table queue");
                    continue;
                }
            };

            if let Err(err) = self.copy_table(oid, part).await {
                if self.ctx.is_shutdown() {
                    info!(table_id = %oid, "table copy interrupted by shutdown");
                    break;
                }

                error!(worker = %self.name, table_id = %oid, ?part, error = %err, "table copy failed");

                if self.ctx.options.fail_fast {
                    self.clear_process().await;
                    return Err(err);
                }

                errors.push(err);
            }
        }

        self.clear_process().await;
        debug!(worker = %self.name, id = self.id, "table copy worker finished");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    async fn copy_table(&mut self, oid: Oid, part: Option<u32>) -> CopyDbResult<()> {
        let (table, part) = self.lookup(oid, part).await?;
        let unit = match &part {
            Some(part) => WorkUnit::TablePart {
                table_oid: table.oid,
                partnum: part.partnum,
            },
            None => WorkUnit::whole_table(table.oid),
        };

        let copy = CopySpec::new(&table, part);
        let command = copy.source_sql();

        match self.ctx.coordinator.claim(unit, &command).await? {
            ClaimOutcome::Claimed(claim) => {
                self.ctx
                    .source()
                    .upsert_process_info(&ProcessInfo {
                        pid: std::process::id(),
                        worker: self.name.clone(),
                        ps_type: "COPY".to_owned(),
                        ps_title: copy.to_string(),
                        table_oid: Some(table.oid),
                        partnum: part.map(|part| part.partnum),
                        index_oid: None,
                    })
                    .await?;

                let bytes = if table.exclude_data {
                    info!(qname = %table.qname, "skipping data of filtered table");
                    0
                } else {
                    self.copy_with_retry(&copy).await?
                };

                self.ctx.coordinator.finish(claim, bytes).await?;
                self.ctx
                    .source()
                    .increment_timing(Section::TableData, 1, bytes)
                    .await?;

                info!(worker = %self.name, %copy, bytes, "copied table data");
            }
            ClaimOutcome::AlreadyDone => {
                debug!(%copy, "table data already copied");
            }
            ClaimOutcome::ClaimedByOther(claimant) => {
                debug!(%copy, pid = claimant.pid, "table data is being copied by another worker");
                return Ok(());
            }
        }

        if self.ctx.options.builds_indexes() {
            on_table_part_done(&self.ctx, &self.follow_up, &table, &mut self.target).await?;
        }

        Ok(())
    }

    async fn lookup(&self, oid: Oid, part: Option<u32>) -> CopyDbResult<(SourceTable, Option<TablePart>)> {
        let catalog = self.ctx.source();

        let found = match part {
            Some(partnum) => catalog
                .lookup_table_part(oid, partnum)
                .await?
                .map(|(table, part)| (table, Some(part))),
            None => catalog.lookup_table_by_oid(oid).await?.map(|table| (table, None)),
        };

        match found {
            Some(found) => Ok(found),
            None => bail!(
                ErrorKind::InvalidData,
                "Table not found in the source catalog",
                format!("table_id: {oid}, part: {part:?}")
            ),
        }
    }

    /// Copies with retries on connection failures.
    ///
    /// Every attempt starts by clearing what a previous attempt may have written.
    async fn copy_with_retry(&mut self, copy: &CopySpec) -> CopyDbResult<u64> {
        let policy = self.ctx.options.retry;
        let mut shutdown_rx = self.ctx.shutdown_rx.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.copy_once(copy).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => err,
            };

            self.source = None;
            self.target = None;

            if !err.is_connection_failure() || attempt >= policy.max_attempts {
                return Err(err);
            }

            let delay = policy.delay(attempt);
            warn!(
                %copy,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "connection failure during table copy, retrying"
            );

            tokio::select! {
                biased;

                _ = shutdown_rx.wait() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn copy_once(&mut self, copy: &CopySpec) -> CopyDbResult<u64> {
        copydb_fail_point(TABLE_COPY_BEFORE_COPY)?;

        if self.source.is_none() {
            self.source = Some(self.ctx.connect_source().await?);
        }
        let target = connected_target(&self.ctx, &mut self.target).await?;
        let Some(source) = self.source.as_mut() else {
            bail!(ErrorKind::InvalidState, "Source client is not connected");
        };

        target.execute(&copy.prepare_sql()).await?;

        self.ctx.connector.copy_rows(source, target, copy).await
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
