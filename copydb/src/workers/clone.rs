//! Supervision of a copy: feeds the work queues, runs the worker pools and stops them in order.
//!
//! Table workers hand index builds to the index queue and index workers hand vacuums to the
//! vacuum queue, so each queue is stopped only once everything that feeds it is done: the index
//! STOPs follow the end of the table copy and the reconciliation sweep, the vacuum STOPs follow
//! the end of the index builds.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::catalog::Section;
use crate::clients::Connector;
use crate::concurrency::queue::{QueueMessage, WorkQueue};
use crate::context::CopyContext;
use crate::coordination::markers::{PhaseMarker, write_marker};
use crate::coordination::{Phase, RunState, TableFollowUp, index_units};
use crate::error::{CopyDbError, CopyDbResult};
use crate::progress::ProgressReport;
use crate::workers::base::WorkerType;
use crate::workers::follow_up::{FollowUpQueues, finish_table, on_index_done};
use crate::workers::index::IndexWorker;
use crate::workers::pool::WorkerPool;
use crate::workers::sequences::reset_sequences;
use crate::workers::table_copy::TableCopyWorker;
use crate::workers::vacuum::VacuumWorker;

/// Errors of a stage, returned at once with fail-fast and collected otherwise.
struct StageErrors {
    fail_fast: bool,
    errors: Vec<CopyDbError>,
}

impl StageErrors {
    fn new(fail_fast: bool) -> Self {
        Self {
            fail_fast,
            errors: Vec::new(),
        }
    }

    fn record(&mut self, result: CopyDbResult<()>) -> CopyDbResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if self.fail_fast => Err(err),
            Err(err) => {
                self.errors.push(err);
                Ok(())
            }
        }
    }

    fn finish(self) -> CopyDbResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.into())
        }
    }
}

/// Start of a section whose timing is recorded in the catalog.
#[derive(Debug, Clone, Copy)]
struct SectionTimer {
    section: Section,
    start: DateTime<Utc>,
}

impl SectionTimer {
    async fn start(ctx: &CopyContext<impl Connector>, section: Section) -> CopyDbResult<Self> {
        let start = Utc::now();
        ctx.source().start_timing(section, start).await?;

        Ok(Self { section, start })
    }

    async fn finish(self, ctx: &CopyContext<impl Connector>) -> CopyDbResult<()> {
        ctx.source()
            .finish_timing(self.section, self.start, Utc::now())
            .await
    }
}

async fn write_phase_done(ctx: &CopyContext<impl Connector>, phase: Phase, units: u64) -> CopyDbResult<()> {
    write_marker(
        &ctx.paths.phase_done(phase),
        &PhaseMarker {
            done_time_epoch: Utc::now().timestamp(),
            units,
        },
    )
    .await?;

    info!(%phase, units, "phase done");

    Ok(())
}

/// Runs the data phases of a copy over an initialized context.
///
/// `state` tells which phases a resumed run already finished.
pub async fn run_copy<C: Connector>(
    ctx: CopyContext<C>,
    state: RunState,
) -> CopyDbResult<ProgressReport> {
    let options = ctx.options.clone();
    let all = SectionTimer::start(&ctx, Section::All).await?;

    let copies_tables = options.runs(Section::TableData) && !state.tables_done;
    let builds_indexes = options.builds_indexes() && !state.indexes_done;
    let vacuums = !options.skip_vacuum && options.runs(Section::Vacuum) && !state.vacuum_done;
    let resets_sequences = options.runs(Section::SetSequences) && !state.sequences_done;

    let table_queue = WorkQueue::create("tables", options.queue_capacity);
    let queues = FollowUpQueues {
        indexes: builds_indexes.then(|| WorkQueue::create("indexes", options.queue_capacity)),
        vacuum: vacuums.then(|| WorkQueue::create("vacuum", options.queue_capacity)),
    };

    info!(
        section = %options.section,
        copies_tables,
        builds_indexes,
        vacuums,
        resets_sequences,
        "starting copy"
    );

    let mut sequence_pool = WorkerPool::new(WorkerType::Sequences, options.fail_fast);
    if resets_sequences {
        let ctx = ctx.clone();
        sequence_pool.spawn(1, async move { reset_sequences(&ctx).await.map(|_| ()) });
    }

    let mut vacuum_pool = WorkerPool::new(WorkerType::Vacuum, options.fail_fast);
    let mut vacuum_timer = None;
    if let Some(queue) = &queues.vacuum {
        vacuum_timer = Some(SectionTimer::start(&ctx, Section::Vacuum).await?);
        for id in 1..=options.vacuum_jobs.max(1) {
            let worker = VacuumWorker::new(id, ctx.clone(), queue.clone());
            vacuum_pool.spawn(id, worker.run());
        }
    }

    let mut index_pool = WorkerPool::new(WorkerType::Index, options.fail_fast);
    let mut index_timer = None;
    if let Some(queue) = &queues.indexes {
        index_timer = Some(SectionTimer::start(&ctx, Section::Indexes).await?);
        for id in 1..=options.index_jobs.max(1) {
            let worker = IndexWorker::new(id, ctx.clone(), queue.clone(), queues.clone());
            index_pool.spawn(id, worker.run());
        }
    }

    let mut table_pool = WorkerPool::new(WorkerType::TableCopy, options.fail_fast);
    let mut table_timer = None;
    if copies_tables {
        table_timer = Some(SectionTimer::start(&ctx, Section::TableData).await?);
        for id in 1..=options.table_jobs.max(1) {
            let worker = TableCopyWorker::new(id, ctx.clone(), table_queue.clone(), queues.clone());
            table_pool.spawn(id, worker.run());
        }
    }

    let produce = produce_stage(&ctx, &queues, &table_queue, table_pool, table_timer);
    let indexes = index_stage(&ctx, &queues, index_pool, index_timer);
    let vacuum = vacuum_stage(&ctx, &queues, vacuum_pool, vacuum_timer);
    let sequences = sequence_pool.wait_all();

    if options.fail_fast {
        tokio::try_join!(produce, indexes, vacuum, sequences)?;
    } else {
        let (produced, indexed, vacuumed, reset) = tokio::join!(produce, indexes, vacuum, sequences);
        let errors: Vec<CopyDbError> = [produced, indexed, vacuumed, reset]
            .into_iter()
            .filter_map(Result::err)
            .collect();
        if !errors.is_empty() {
            return Err(errors.into());
        }
    }

    let catalog = ctx.source();
    catalog.delete_processes(std::process::id()).await?;
    all.finish(&ctx).await?;

    if !ctx.is_shutdown() {
        let done = catalog.count_summary_done().await?;
        if copies_tables {
            write_phase_done(&ctx, Phase::Tables, done.table_parts).await?;
        }
        if builds_indexes {
            write_phase_done(&ctx, Phase::Indexes, done.indexes + done.constraints).await?;
        }
        if vacuums {
            let vacuumed = catalog
                .timings()
                .await?
                .into_iter()
                .find(|timing| timing.section == Section::Vacuum)
                .map(|timing| timing.count)
                .unwrap_or_default();
            write_phase_done(&ctx, Phase::Vacuum, vacuumed).await?;
        }
    }

    let report = ProgressReport::collect(catalog).await?;
    report.write(&ctx.paths.summary_file).await?;

    if ctx.is_shutdown() {
        warn!("copy interrupted by shutdown, resume to finish it");
    } else {
        info!(
            table_parts = report.done.table_parts,
            indexes = report.done.indexes,
            bytes = %report.bytes_pretty,
            "copy done"
        );
    }

    Ok(report)
}

/// Feeds the table queue, then completes the follow-up of every table and stops the queues
/// it feeds.
async fn produce_stage<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    table_queue: &WorkQueue,
    table_pool: WorkerPool,
    table_timer: Option<SectionTimer>,
) -> CopyDbResult<()> {
    let options = &ctx.options;
    let mut errors = StageErrors::new(options.fail_fast);
    let mut target = None;

    if let Some(timer) = table_timer {
        let producer = enqueue_tables(ctx, table_queue, options.table_jobs.max(1));
        errors.record(table_pool.wait_with_producer(table_queue, producer).await)?;
        timer.finish(ctx).await?;
    }

    if !ctx.is_shutdown() {
        let result = match (&queues.indexes, &queues.vacuum) {
            (Some(_), _) if options.runs(Section::TableData) => sweep(ctx, queues, &mut target).await,
            (Some(_), _) => enqueue_all_indexes(ctx, queues, &mut target).await,
            (None, Some(vacuum_queue)) => enqueue_all_vacuums(ctx, vacuum_queue).await,
            (None, None) => Ok(()),
        };
        errors.record(result)?;
    }

    if !ctx.is_shutdown() {
        match (&queues.indexes, &queues.vacuum) {
            (Some(index_queue), _) => {
                errors.record(index_queue.send_stops(options.index_jobs.max(1)).await)?;
            }
            (None, Some(vacuum_queue)) => {
                errors.record(vacuum_queue.send_stops(options.vacuum_jobs.max(1)).await)?;
            }
            (None, None) => {}
        }
    }

    errors.finish()
}

async fn enqueue_tables<C: Connector>(ctx: &CopyContext<C>, queue: &WorkQueue, jobs: usize) -> CopyDbResult<()> {
    let catalog = ctx.source();
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    let tables = catalog.tables().await?;
    info!(tables = tables.len(), "enqueueing tables");

    for table in tables {
        let messages: Vec<QueueMessage> = if table.partcount > 0 {
            (1..=table.partcount)
                .map(|part| QueueMessage::TableOid {
                    oid: table.oid,
                    part: Some(part),
                })
                .collect()
        } else {
            vec![QueueMessage::TableOid {
                oid: table.oid,
                part: None,
            }]
        };

        for message in messages {
            if queue
                .send_until_shutdown(message, &mut shutdown_rx)
                .await?
                .should_shutdown()
            {
                return Ok(());
            }
        }
    }

    queue.send_stops(jobs).await
}

/// Completes the follow-up of tables whose copy finished but whose follow-up was lost.
async fn sweep<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    target: &mut Option<C::Target>,
) -> CopyDbResult<()> {
    let catalog = ctx.source();
    let mut shutdown_rx = ctx.shutdown_rx.clone();
    let mut enqueued = 0;
    let mut finished = 0;

    for table in catalog.tables().await? {
        let indexes = catalog.table_indexes(table.oid).await?;

        match ctx.coordinator.reconcile_table(&table, &indexes).await? {
            TableFollowUp::Nothing => {}
            TableFollowUp::BuildIndexes(oids) => {
                let Some(index_queue) = &queues.indexes else {
                    continue;
                };
                for oid in oids {
                    if index_queue
                        .send_until_shutdown(QueueMessage::IndexOid { oid }, &mut shutdown_rx)
                        .await?
                        .should_shutdown()
                    {
                        return Ok(());
                    }
                    enqueued += 1;
                }
            }
            TableFollowUp::IndexesDone => {
                // An index worker may win the same election concurrently.
                if on_index_done(ctx, queues, table.oid, target).await? {
                    finished += 1;
                }
            }
            TableFollowUp::ConstraintsMissing => {
                finish_table(ctx, queues, table.oid, &indexes, target).await?;
                finished += 1;
            }
        }
    }

    if enqueued > 0 || finished > 0 {
        info!(enqueued, finished, "reconciled table follow-ups");
    }

    Ok(())
}

/// Enqueues the index builds of every table, for runs that build indexes without copying.
async fn enqueue_all_indexes<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    target: &mut Option<C::Target>,
) -> CopyDbResult<()> {
    let Some(index_queue) = &queues.indexes else {
        return Ok(());
    };
    let catalog = ctx.source();
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    for table in catalog.tables().await? {
        let indexes = catalog.table_indexes(table.oid).await?;
        let units = index_units(table.oid, &indexes);
        if units.is_empty() {
            on_index_done(ctx, queues, table.oid, target).await?;
            continue;
        }

        for unit in units {
            let message = QueueMessage::IndexOid {
                oid: unit.object_oid(),
            };
            if index_queue
                .send_until_shutdown(message, &mut shutdown_rx)
                .await?
                .should_shutdown()
            {
                return Ok(());
            }
        }
    }

    Ok(())
}

async fn enqueue_all_vacuums<C: Connector>(ctx: &CopyContext<C>, queue: &WorkQueue) -> CopyDbResult<()> {
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    for table in ctx.source().tables().await? {
        let message = QueueMessage::TableOid {
            oid: table.oid,
            part: None,
        };
        if queue
            .send_until_shutdown(message, &mut shutdown_rx)
            .await?
            .should_shutdown()
        {
            break;
        }
    }

    Ok(())
}

/// Waits for the index workers, then stops the vacuum queue they feed.
async fn index_stage<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    index_pool: WorkerPool,
    index_timer: Option<SectionTimer>,
) -> CopyDbResult<()> {
    let Some(index_queue) = &queues.indexes else {
        return Ok(());
    };

    let mut errors = StageErrors::new(ctx.options.fail_fast);
    let result = index_pool.wait_all().await;
    index_queue.unlink().await;
    errors.record(result)?;

    if let Some(timer) = index_timer {
        timer.finish(ctx).await?;
    }

    if let Some(vacuum_queue) = &queues.vacuum {
        if !ctx.is_shutdown() {
            errors.record(vacuum_queue.send_stops(ctx.options.vacuum_jobs.max(1)).await)?;
        }
    }

    errors.finish()
}

async fn vacuum_stage<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    vacuum_pool: WorkerPool,
    vacuum_timer: Option<SectionTimer>,
) -> CopyDbResult<()> {
    let Some(vacuum_queue) = &queues.vacuum else {
        return Ok(());
    };

    let result = vacuum_pool.wait_all().await;
    vacuum_queue.unlink().await;
    result?;

    if let Some(timer) = vacuum_timer {
        timer.finish(ctx).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copydb_error;
    use crate::error::ErrorKind;

    #[test]
    fn stage_errors_are_collected_without_fail_fast() {
        let mut errors = StageErrors::new(false);
        errors
            .record(Err(copydb_error!(ErrorKind::TargetQueryFailed, "Index failed")))
            .unwrap();
        errors.record(Ok(())).unwrap();
        errors
            .record(Err(copydb_error!(ErrorKind::WorkUnitFailed, "Copy failed")))
            .unwrap();

        let err = errors.finish().unwrap_err();
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::TargetQueryFailed, ErrorKind::WorkUnitFailed]
        );
    }

    #[test]
    fn stage_errors_are_returned_at_once_with_fail_fast() {
        let mut errors = StageErrors::new(true);
        let err = errors
            .record(Err(copydb_error!(ErrorKind::WorkUnitFailed, "Copy failed")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkUnitFailed);
        assert!(errors.finish().is_ok());
    }
}
