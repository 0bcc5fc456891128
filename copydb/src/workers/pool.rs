use std::future::Future;

use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::concurrency::queue::WorkQueue;
use crate::copydb_error;
use crate::error::{CopyDbResult, ErrorKind};
use crate::workers::base::WorkerType;

/// Pool of identical workers consuming one work queue.
///
/// Workers are tokio tasks owned by a [`JoinSet`]; dropping the pool aborts every worker still
/// running. With `fail_fast`, the first failing worker aborts the others.
#[derive(Debug)]
pub struct WorkerPool {
    worker_type: WorkerType,
    fail_fast: bool,
    join_set: JoinSet<(usize, CopyDbResult<()>)>,
}

impl WorkerPool {
    pub fn new(worker_type: WorkerType, fail_fast: bool) -> Self {
        Self {
            worker_type,
            fail_fast,
            join_set: JoinSet::new(),
        }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// Spawns worker `id`.
    pub fn spawn<F>(&mut self, id: usize, future: F)
    where
        F: Future<Output = CopyDbResult<()>> + Send + 'static,
    {
        let span = info_span!("worker", kind = %self.worker_type, id);
        self.join_set.spawn(
            async move {
                let result = future.await;
                (id, result)
            }
            .instrument(span),
        );

        debug!(kind = %self.worker_type, id, "spawned worker");
    }

    pub fn len(&self) -> usize {
        self.join_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.join_set.is_empty()
    }

    /// Runs `producer` while waiting for the workers.
    ///
    /// When the producer fails before stopping the workers, one STOP per worker is sent on its
    /// behalf. Once every worker has exited `queue` is unlinked, so a producer blocked on a full
    /// queue fails instead of waiting forever. Errors of both sides are returned together.
    pub async fn wait_with_producer<F>(self, queue: &WorkQueue, producer: F) -> CopyDbResult<()>
    where
        F: Future<Output = CopyDbResult<()>>,
    {
        let workers_count = self.len();
        let worker_type = self.worker_type;

        let producer = async {
            let result = producer.await;
            if let Err(err) = &result {
                warn!(kind = %worker_type, error = %err, "producer failed, stopping workers");
                // Fails only once the workers are gone, which is what the STOPs are for.
                if let Err(stop_err) = queue.send_stops(workers_count).await {
                    debug!(kind = %worker_type, error = %stop_err, "workers already stopped");
                }
            }
            result
        };
        let workers = async {
            let result = self.wait_all().await;
            queue.unlink().await;
            result
        };

        match tokio::join!(producer, workers) {
            (Ok(()), waited) => waited,
            (Err(err), Ok(())) => Err(err),
            (Err(produced), Err(waited)) => Err(vec![waited, produced].into()),
        }
    }

    /// Waits for every worker and aggregates their errors.
    pub async fn wait_all(mut self) -> CopyDbResult<()> {
        let mut errors = Vec::new();

        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok((id, Ok(()))) => {
                    debug!(kind = %self.worker_type, id, "worker finished");
                }
                Ok((id, Err(err))) => {
                    error!(kind = %self.worker_type, id, error = %err, "worker completed with error");
                    errors.push(err);

                    if self.fail_fast {
                        self.join_set.abort_all();
                    }
                }
                Err(join_err) => {
                    if join_err.is_cancelled() {
                        debug!(kind = %self.worker_type, "worker task was cancelled");
                        continue;
                    }

                    errors.push(copydb_error!(
                        ErrorKind::WorkerPanic,
                        "Worker panicked",
                        detail = format!("worker: {}, error: {join_err}", self.worker_type),
                        source: join_err
                    ));

                    if self.fail_fast {
                        self.join_set.abort_all();
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::catalog::CompletionGate;
    use crate::concurrency::queue::QueueMessage;
    use crate::concurrency::shutdown::{ShutdownResult, create_shutdown_channel};
    use crate::coordination::WorkUnit;
    use crate::error::CopyDbError;
    use crate::test_utils::memory::MemoryServer;
    use crate::test_utils::run::{TestRun, test_options};
    use crate::types::Oid;

    /// Worker receiving until its STOP.
    async fn consume(queue: WorkQueue) -> CopyDbResult<()> {
        let (_shutdown_tx, mut shutdown_rx) = create_shutdown_channel();
        loop {
            match queue.receive(&mut shutdown_rx).await? {
                ShutdownResult::Ok(QueueMessage::Stop) | ShutdownResult::Shutdown(()) => {
                    return Ok(());
                }
                ShutdownResult::Ok(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn errors_of_all_workers_are_aggregated() {
        let mut pool = WorkerPool::new(WorkerType::Index, false);
        pool.spawn(1, async { Ok(()) });
        pool.spawn(2, async {
            Err(copydb_error!(ErrorKind::TargetQueryFailed, "Index failed"))
        });
        pool.spawn(3, async {
            Err(copydb_error!(ErrorKind::TargetQueryFailed, "Index failed"))
        });

        let err = pool.wait_all().await.unwrap_err();
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::TargetQueryFailed, ErrorKind::TargetQueryFailed]
        );
    }

    #[tokio::test]
    async fn panics_are_reported_with_the_worker_kind() {
        let mut pool = WorkerPool::new(WorkerType::Vacuum, false);
        pool.spawn(1, async {
            let units: Vec<u32> = Vec::new();
            assert!(!units.is_empty(), "no unit to vacuum");
            Ok(())
        });

        let err = pool.wait_all().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WorkerPanic);
        assert!(err.detail().is_some_and(|detail| detail.starts_with("worker: vacuum")));
    }

    #[tokio::test]
    async fn fail_fast_aborts_the_other_workers() {
        let mut pool = WorkerPool::new(WorkerType::TableCopy, true);
        pool.spawn(1, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        pool.spawn(2, async {
            Err(copydb_error!(ErrorKind::WorkUnitFailed, "Copy failed"))
        });

        let err = tokio::time::timeout(Duration::from_secs(5), pool.wait_all())
            .await
            .expect("pool should stop after the first failure")
            .unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::WorkUnitFailed]);
    }

    #[tokio::test]
    async fn producers_blocked_on_dead_workers_fail() {
        let queue = WorkQueue::create("tables", 1);
        let mut pool = WorkerPool::new(WorkerType::TableCopy, false);
        pool.spawn(1, async { Ok(()) });

        let producer = {
            let queue = queue.clone();
            async move {
                for _ in 0..4 {
                    queue.send(QueueMessage::Stop).await?;
                }
                Ok::<_, CopyDbError>(())
            }
        };

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            pool.wait_with_producer(&queue, producer),
        )
        .await
        .expect("producer should not hang")
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
    }

    async fn list_tables_then_fail(queue: WorkQueue) -> CopyDbResult<()> {
        queue
            .send(QueueMessage::TableOid {
                oid: Oid(10),
                part: None,
            })
            .await?;

        Err(copydb_error!(
            ErrorKind::CatalogQueryFailed,
            "Failed to list tables"
        ))
    }

    #[tokio::test]
    async fn failing_producers_stop_the_workers() {
        let queue = WorkQueue::create("tables", 2);
        let mut pool = WorkerPool::new(WorkerType::TableCopy, false);
        for id in 1..=3 {
            pool.spawn(id, consume(queue.clone()));
        }

        let producer = list_tables_then_fail(queue.clone());

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            pool.wait_with_producer(&queue, producer),
        )
        .await
        .expect("workers should stop when the producer fails")
        .unwrap_err();
        assert_eq!(err.kinds(), vec![ErrorKind::CatalogQueryFailed]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finishing_parts_elect_a_single_winner() {
        const PARTS: u32 = 6;

        let run = TestRun::new().await;
        let server = MemoryServer::new(Default::default());
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let ctx = run.context(server.connector(), test_options(), shutdown_rx);

        let table_oid = Oid(10);
        let parts = WorkUnit::table_parts(table_oid, PARTS);
        let barrier = Arc::new(tokio::sync::Barrier::new(parts.len()));
        let winners = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(WorkerType::TableCopy, false);
        for (id, part) in parts.iter().copied().enumerate() {
            let coordinator = ctx.coordinator.clone();
            let parts = parts.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            pool.spawn(id + 1, async move {
                coordinator.mark_done(part, "COPY public.t").await?;
                barrier.wait().await;
                if coordinator
                    .complete(CompletionGate::PartsDone, table_oid, &parts)
                    .await?
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            });
        }

        pool.wait_all().await.unwrap();
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
