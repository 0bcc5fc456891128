use std::pin::pin;
use std::time::Duration;

use copydb_config::shared::ReplayConfig;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::bail;
use crate::catalog::{Catalog, LsnTrackingPoint, Sentinel, durable_lsn};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{CopyDbResult, ErrorKind};
use crate::replay::applier::Applier;
use crate::replay::event::ReplayEvent;
use crate::types::{PgLsn, invalid_lsn, is_valid_lsn, parse_lsn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Apply without waiting for the sentinel `apply` flag.
    pub replay_mode: bool,
    pub endpos: Option<PgLsn>,
    /// How often the sentinel is re-read while waiting for the `apply` flag.
    pub poll_interval: Duration,
}

impl ReplayOptions {
    pub fn from_config(config: &ReplayConfig) -> CopyDbResult<Self> {
        Ok(Self {
            replay_mode: config.replay,
            endpos: config.endpos.as_deref().map(parse_lsn).transpose()?,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            replay_mode: false,
            endpos: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Why the replay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayLoopResult {
    /// Stopped on shutdown or at the end of the stream, and can be resumed.
    Paused,
    /// The end position was reached.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub result: ReplayLoopResult,
    /// Last source position applied.
    pub replay_lsn: PgLsn,
    pub transactions: u64,
}

/// What to do after one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ReplayAction {
    #[default]
    Continue,
    Pause,
    Complete,
}

impl ReplayAction {
    fn to_result(self) -> Option<ReplayLoopResult> {
        match self {
            ReplayAction::Continue => None,
            ReplayAction::Pause => Some(ReplayLoopResult::Paused),
            ReplayAction::Complete => Some(ReplayLoopResult::Completed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    xid: u32,
    lsn: PgLsn,
    /// Already applied by a previous run.
    skipped: bool,
}

#[derive(Debug)]
struct ReplayState {
    transaction: Option<OpenTransaction>,
    replay_lsn: PgLsn,
    /// Target position of the last commit.
    target_lsn: PgLsn,
    endpos: PgLsn,
    /// Applied positions not known to be durable yet, oldest first.
    tracking: Vec<LsnTrackingPoint>,
    transactions: u64,
    shutdown_deferred: bool,
}

impl ReplayState {
    fn endpos_reached(&self) -> bool {
        is_valid_lsn(self.endpos) && self.replay_lsn >= self.endpos
    }

    fn refresh(&mut self, sentinel: &Sentinel) {
        if is_valid_lsn(sentinel.endpos) {
            self.endpos = sentinel.endpos;
        }
    }
}

/// Applies a change stream to the target, driven by the sentinel.
///
/// Transactions whose commit position is not past the sentinel `replay_lsn` were applied
/// by a previous run and are skipped. Every commit records a tracking point pairing the
/// source commit position with the target position it was written at; checkpoints turn the
/// newest flushed point into the durable `replay_lsn`.
#[derive(Debug)]
pub struct ReplayController<A> {
    catalog: Catalog,
    applier: A,
    options: ReplayOptions,
    shutdown_rx: ShutdownRx,
    state: ReplayState,
}

impl<A: Applier> ReplayController<A> {
    pub fn new(
        catalog: Catalog,
        applier: A,
        options: ReplayOptions,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            catalog,
            applier,
            options,
            shutdown_rx,
            state: ReplayState {
                transaction: None,
                replay_lsn: invalid_lsn(),
                target_lsn: invalid_lsn(),
                endpos: invalid_lsn(),
                tracking: Vec::new(),
                transactions: 0,
                shutdown_deferred: false,
            },
        }
    }

    pub async fn run<S>(mut self, events: S) -> CopyDbResult<ReplayOutcome>
    where
        S: Stream<Item = CopyDbResult<ReplayEvent>> + Send,
    {
        if let Some(endpos) = self.options.endpos {
            self.catalog.update_sentinel_endpos(endpos).await?;
        }

        if let Some(result) = self.wait_for_apply().await? {
            return Ok(self.outcome(result));
        }

        info!(
            replay_lsn = %self.state.replay_lsn,
            endpos = %self.state.endpos,
            "replaying changes"
        );

        let mut events = pin!(events);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait(), if !self.state.shutdown_deferred => {
                    if self.state.transaction.is_none() {
                        info!("shutting down replay outside a transaction");
                        self.checkpoint().await?;
                        return Ok(self.outcome(ReplayLoopResult::Paused));
                    }

                    info!("deferring shutdown until the end of the transaction");
                    self.state.shutdown_deferred = true;
                }

                event = events.next() => {
                    let Some(event) = event else {
                        if let Some(transaction) = self.state.transaction {
                            warn!(xid = transaction.xid, "change stream ended inside a transaction");
                        }
                        self.checkpoint().await?;
                        return Ok(self.outcome(ReplayLoopResult::Paused));
                    };

                    let action = self.handle_event(event?).await?;
                    if let Some(result) = action.to_result() {
                        info!(
                            replay_lsn = %self.state.replay_lsn,
                            transactions = self.state.transactions,
                            ?result,
                            "replay stopped"
                        );
                        return Ok(self.outcome(result));
                    }
                }
            }
        }
    }

    fn outcome(&self, result: ReplayLoopResult) -> ReplayOutcome {
        ReplayOutcome {
            result,
            replay_lsn: self.state.replay_lsn,
            transactions: self.state.transactions,
        }
    }

    /// Polls the sentinel until applying is enabled.
    ///
    /// Returns the result to stop with when shutdown is requested or the end position was
    /// already reached.
    async fn wait_for_apply(&mut self) -> CopyDbResult<Option<ReplayLoopResult>> {
        loop {
            let Some(sentinel) = self.catalog.sentinel().await? else {
                bail!(
                    ErrorKind::InvalidState,
                    "Replication is not configured",
                    "the sentinel must be set up before replaying changes"
                );
            };

            self.state.refresh(&sentinel);
            if is_valid_lsn(sentinel.replay_lsn) && sentinel.replay_lsn > self.state.replay_lsn {
                self.state.replay_lsn = sentinel.replay_lsn;
            }

            if sentinel.endpos_reached() {
                info!(endpos = %sentinel.endpos, "end position already reached");
                return Ok(Some(ReplayLoopResult::Completed));
            }

            if self.options.replay_mode || sentinel.apply {
                return Ok(None);
            }

            debug!("waiting for the sentinel apply flag");

            tokio::select! {
                biased;

                _ = self.shutdown_rx.wait() => return Ok(Some(ReplayLoopResult::Paused)),
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    async fn handle_event(&mut self, event: ReplayEvent) -> CopyDbResult<ReplayAction> {
        match event {
            ReplayEvent::Begin { xid, lsn } => self.handle_begin(xid, lsn).await,
            ReplayEvent::Statement { sql, .. } => {
                let Some(transaction) = self.state.transaction else {
                    bail!(
                        ErrorKind::InvalidState,
                        "Invalid transaction state",
                        "a transaction must be open before applying statements"
                    );
                };

                if !transaction.skipped {
                    self.applier.apply(&sql).await?;
                }

                Ok(ReplayAction::Continue)
            }
            ReplayEvent::Commit { lsn } => self.handle_commit(lsn).await,
            ReplayEvent::Keepalive { lsn } => {
                if self.state.transaction.is_none() && lsn > self.state.replay_lsn {
                    self.state.tracking.push(LsnTrackingPoint {
                        source: lsn,
                        target: self.state.target_lsn,
                    });
                    self.state.replay_lsn = lsn;
                }

                self.checkpoint().await
            }
            ReplayEvent::SwitchWal { lsn } => {
                debug!(%lsn, "switching WAL file");
                self.checkpoint().await
            }
            ReplayEvent::Endpos { lsn } => {
                self.catalog.update_sentinel_endpos(lsn).await?;
                self.state.endpos = lsn;
                info!(endpos = %lsn, "end position updated");

                if self.state.transaction.is_none() {
                    return self.checkpoint().await;
                }

                Ok(ReplayAction::Continue)
            }
        }
    }

    async fn handle_begin(&mut self, xid: u32, lsn: PgLsn) -> CopyDbResult<ReplayAction> {
        if let Some(transaction) = self.state.transaction {
            bail!(
                ErrorKind::InvalidState,
                "Invalid transaction state",
                format!("BEGIN {xid} while transaction {} is open", transaction.xid)
            );
        }

        if is_valid_lsn(self.state.endpos) && lsn > self.state.endpos {
            info!(xid, %lsn, endpos = %self.state.endpos, "transaction commits past the end position");
            self.checkpoint().await?;
            return Ok(ReplayAction::Complete);
        }

        let skipped = is_valid_lsn(self.state.replay_lsn) && lsn <= self.state.replay_lsn;
        if skipped {
            debug!(xid, %lsn, "skipping transaction applied by a previous run");
        } else {
            self.applier.begin(xid).await?;
        }

        self.state.transaction = Some(OpenTransaction { xid, lsn, skipped });

        Ok(ReplayAction::Continue)
    }

    async fn handle_commit(&mut self, lsn: PgLsn) -> CopyDbResult<ReplayAction> {
        let Some(transaction) = self.state.transaction.take() else {
            bail!(
                ErrorKind::InvalidState,
                "Invalid transaction state",
                format!("COMMIT at {lsn} without an open transaction")
            );
        };

        if !transaction.skipped {
            if lsn != transaction.lsn {
                warn!(xid = transaction.xid, begin_lsn = %transaction.lsn, commit_lsn = %lsn, "commit position differs from the announced one");
            }

            let target = self.applier.commit().await?;
            self.state.tracking.push(LsnTrackingPoint {
                source: lsn,
                target,
            });
            self.state.target_lsn = target;
            self.state.replay_lsn = lsn;
            self.state.transactions += 1;

            debug!(xid = transaction.xid, %lsn, target_lsn = %target, "applied transaction");
        }

        if self.state.endpos_reached() {
            self.checkpoint().await?;
            return Ok(ReplayAction::Complete);
        }

        if self.state.shutdown_deferred {
            self.checkpoint().await?;
            return Ok(ReplayAction::Pause);
        }

        Ok(ReplayAction::Continue)
    }

    /// Publishes the durable position in the sentinel and persists the tracking points.
    async fn checkpoint(&mut self) -> CopyDbResult<ReplayAction> {
        let flush_lsn = self.applier.flush_lsn().await?;

        let mut points = self.state.tracking.clone();
        points.sort_by(|a, b| b.source.cmp(&a.source));

        if let Some(durable) = durable_lsn(&points, flush_lsn) {
            let sentinel = self.catalog.sync_apply(durable).await?;
            self.state.refresh(&sentinel);
            self.state.tracking.retain(|point| point.source >= durable);

            debug!(%durable, %flush_lsn, "checkpoint");
        }

        self.catalog.save_lsn_tracking(&self.state.tracking).await?;

        if self.state.transaction.is_none() && self.state.endpos_reached() {
            return Ok(ReplayAction::Complete);
        }

        Ok(ReplayAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::catalog::CatalogRole;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::applier::MemoryApplier;

    fn lsn(value: &str) -> PgLsn {
        parse_lsn(value).unwrap()
    }

    fn transaction(xid: u32, commit: &str) -> Vec<CopyDbResult<ReplayEvent>> {
        vec![
            Ok(ReplayEvent::Begin {
                xid,
                lsn: lsn(commit),
            }),
            Ok(ReplayEvent::Statement {
                lsn: lsn(commit),
                sql: format!("insert into t values ({xid})"),
            }),
            Ok(ReplayEvent::Commit { lsn: lsn(commit) }),
        ]
    }

    async fn catalog(dir: &tempfile::TempDir) -> Catalog {
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn replay_stops_at_the_end_position() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(&dir).await;
        catalog
            .setup_sentinel(lsn("0/100"), lsn("0/300"))
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let applier = MemoryApplier::new();
        let options = ReplayOptions {
            replay_mode: true,
            ..Default::default()
        };
        let events: Vec<_> = [
            transaction(1, "0/200"),
            transaction(2, "0/300"),
            transaction(3, "0/400"),
        ]
        .concat();

        let outcome = ReplayController::new(catalog.clone(), applier.clone(), options, shutdown_rx)
            .run(stream::iter(events))
            .await
            .unwrap();

        assert_eq!(outcome.result, ReplayLoopResult::Completed);
        assert_eq!(outcome.replay_lsn, lsn("0/300"));
        assert_eq!(outcome.transactions, 2);
        assert_eq!(applier.committed_xids().await, vec![1, 2]);

        let sentinel = catalog.sentinel().await.unwrap().unwrap();
        assert!(sentinel.endpos_reached());
    }

    #[tokio::test]
    async fn transactions_applied_before_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(&dir).await;
        catalog
            .setup_sentinel(lsn("0/100"), crate::types::invalid_lsn())
            .await
            .unwrap();
        catalog.sync_apply(lsn("0/200")).await.unwrap();
        catalog.update_sentinel_apply(true).await.unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let applier = MemoryApplier::new();
        let events: Vec<_> = [transaction(1, "0/200"), transaction(2, "0/280")].concat();

        let outcome = ReplayController::new(
            catalog.clone(),
            applier.clone(),
            ReplayOptions::default(),
            shutdown_rx,
        )
        .run(stream::iter(events))
        .await
        .unwrap();

        assert_eq!(outcome.result, ReplayLoopResult::Paused);
        assert_eq!(applier.committed_xids().await, vec![2]);

        let sentinel = catalog.sentinel().await.unwrap().unwrap();
        assert_eq!(sentinel.replay_lsn, lsn("0/280"));
    }

    #[tokio::test]
    async fn statements_outside_a_transaction_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog(&dir).await;
        catalog
            .setup_sentinel(lsn("0/100"), crate::types::invalid_lsn())
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let options = ReplayOptions {
            replay_mode: true,
            ..Default::default()
        };

        let events = vec![Ok(ReplayEvent::Statement {
            lsn: lsn("0/150"),
            sql: "select 1".to_string(),
        })];
        let err = ReplayController::new(catalog, MemoryApplier::new(), options, shutdown_rx)
            .run(stream::iter(events))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
