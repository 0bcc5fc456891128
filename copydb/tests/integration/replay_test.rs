use std::sync::Arc;
use std::time::Duration;

use copydb::coordination::RunMode;
use copydb::error::CopyDbResult;
use copydb::pipeline::SentinelUpdate;
use copydb::replay::{ReplayEvent, ReplayLoopResult, ReplayOptions};
use copydb::test_utils::applier::MemoryApplier;
use copydb::test_utils::memory::MemoryServer;
use copydb::types::PgLsn;
use copydb_telemetry::tracing::init_test_tracing;
use futures::stream;

use crate::support::{full_clone_options, items_schema, open_catalogs, pipeline, pipeline_config};

const WAL_START: u64 = 0x0100_0000;

fn lsn(offset: u64) -> PgLsn {
    PgLsn::from(WAL_START + offset)
}

/// One transaction per `(xid, commit offset)`, each inserting one row.
fn transactions(commits: &[(u32, u64)]) -> Vec<CopyDbResult<ReplayEvent>> {
    let mut events = Vec::new();
    for &(xid, offset) in commits {
        events.push(ReplayEvent::Begin {
            xid,
            lsn: lsn(offset),
        });
        events.push(ReplayEvent::Statement {
            lsn: lsn(offset - 0x08),
            sql: format!("insert into public.items(id, payload) values ({xid}, 'row {xid}')"),
        });
        events.push(ReplayEvent::Commit { lsn: lsn(offset) });
    }

    events.into_iter().map(Ok).collect()
}

fn replay_mode(endpos: Option<PgLsn>) -> ReplayOptions {
    ReplayOptions {
        replay_mode: true,
        endpos,
        poll_interval: Duration::from_millis(10),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_stops_at_the_end_position() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    let applier = MemoryApplier::new();

    let events = transactions(&[(700, 0x100), (701, 0x200), (702, 0x300)]);
    let outcome = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    )
    .replay(applier.clone(), stream::iter(events), replay_mode(Some(lsn(0x200))))
    .await
    .unwrap();

    assert_eq!(outcome.result, ReplayLoopResult::Completed);
    assert_eq!(outcome.transactions, 2);
    assert_eq!(outcome.replay_lsn, lsn(0x200));
    assert_eq!(applier.committed_xids().await, vec![700, 701]);
    assert_eq!(applier.committed_statements().await.len(), 2);
    assert!(!applier.has_open_transaction().await);

    let catalogs = open_catalogs(dir.path()).await;
    let sentinel = catalogs.source.sentinel().await.unwrap().unwrap();
    assert_eq!(sentinel.startpos, lsn(0));
    assert_eq!(sentinel.endpos, lsn(0x200));
    assert_eq!(sentinel.replay_lsn, lsn(0x200));
    assert!(sentinel.endpos_reached());
    catalogs.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_skips_transactions_applied_by_a_previous_run() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    let config = || pipeline_config(dir.path(), RunMode::Resume, full_clone_options());

    let first = MemoryApplier::new();
    let outcome = pipeline(&server, config())
        .replay(
            first.clone(),
            stream::iter(transactions(&[(700, 0x100), (701, 0x200)])),
            replay_mode(None),
        )
        .await
        .unwrap();
    assert_eq!(outcome.result, ReplayLoopResult::Paused);
    assert_eq!(first.committed_xids().await, vec![700, 701]);

    // The stream restarts from an older position, as a receiver does after a restart.
    let second = MemoryApplier::new();
    let outcome = pipeline(&server, config())
        .replay(
            second.clone(),
            stream::iter(transactions(&[(700, 0x100), (701, 0x200), (702, 0x300)])),
            replay_mode(None),
        )
        .await
        .unwrap();

    assert_eq!(outcome.result, ReplayLoopResult::Paused);
    assert_eq!(outcome.transactions, 1);
    assert_eq!(outcome.replay_lsn, lsn(0x300));
    assert_eq!(second.committed_xids().await, vec![702]);
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_waits_for_the_apply_flag() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    let config = || pipeline_config(dir.path(), RunMode::Resume, full_clone_options());
    let waiting = ReplayOptions {
        replay_mode: false,
        ..replay_mode(None)
    };

    // Nothing is applied before the flag is set, and shutdown stops the wait.
    let pipeline_handle = Arc::new(pipeline(&server, config()));
    let shutdown_tx = pipeline_handle.shutdown_tx();
    let applier = MemoryApplier::new();
    let task = tokio::spawn({
        let pipeline_handle = pipeline_handle.clone();
        let applier = applier.clone();
        let options = waiting.clone();
        async move {
            pipeline_handle
                .replay(
                    applier,
                    stream::iter(transactions(&[(700, 0x100)])),
                    options,
                )
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.shutdown().unwrap();
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(outcome.result, ReplayLoopResult::Paused);
    assert_eq!(outcome.transactions, 0);
    assert!(applier.committed_xids().await.is_empty());

    let sentinel = pipeline(&server, config())
        .update_sentinel(SentinelUpdate::Apply(true))
        .await
        .unwrap();
    assert!(sentinel.apply);
    assert!(!sentinel.endpos_reached());

    let applier = MemoryApplier::new();
    let outcome = pipeline(&server, config())
        .replay(
            applier.clone(),
            stream::iter(transactions(&[(700, 0x100)])),
            waiting,
        )
        .await
        .unwrap();

    assert_eq!(outcome.transactions, 1);
    assert_eq!(applier.committed_xids().await, vec![700]);
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_refuses_statements_outside_a_transaction() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let server = MemoryServer::new(items_schema());
    let events = vec![Ok(ReplayEvent::Statement {
        lsn: lsn(0x10),
        sql: "delete from public.items".to_owned(),
    })];

    let err = pipeline(
        &server,
        pipeline_config(dir.path(), RunMode::Fresh, full_clone_options()),
    )
    .replay(MemoryApplier::new(), stream::iter(events), replay_mode(None))
    .await
    .unwrap_err();

    assert_eq!(err.kind(), copydb::error::ErrorKind::InvalidState);
}
