//! Work triggered by finished units: index builds once a table is copied, constraints and
//! vacuum once its indexes are built.

use pg_escape::quote_identifier;
use tracing::{debug, info};

use crate::bail;
use crate::catalog::{CompletionGate, ProcessInfo, Section, SourceConstraint, SourceIndex, SourceTable};
use crate::clients::{Connector, TargetClient};
use crate::concurrency::queue::{QueueMessage, WorkQueue};
use crate::context::CopyContext;
use crate::coordination::{ClaimOutcome, WorkUnit, index_units};
use crate::error::{CopyDbResult, ErrorKind};
use crate::failpoints::{PARTS_DONE_BEFORE_ENQUEUE, copydb_fail_point};
use crate::types::Oid;

/// Queues fed by workers once their unit is done.
///
/// A queue is absent when the run does not include its phase.
#[derive(Debug, Clone, Default)]
pub struct FollowUpQueues {
    pub indexes: Option<WorkQueue>,
    pub vacuum: Option<WorkQueue>,
}

/// Returns the target client in `slot`, connecting it first when needed.
pub async fn connected_target<'a, C: Connector>(
    ctx: &CopyContext<C>,
    slot: &'a mut Option<C::Target>,
) -> CopyDbResult<&'a mut C::Target> {
    if slot.is_none() {
        *slot = Some(ctx.connector.connect_target().await?);
    }

    match slot.as_mut() {
        Some(target) => Ok(target),
        None => bail!(ErrorKind::InvalidState, "Target client is not connected"),
    }
}

/// Runs after a part of `table` is done.
///
/// The single winner of the parts-done gate enqueues the index builds of the table.
pub async fn on_table_part_done<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    table: &SourceTable,
    target: &mut Option<C::Target>,
) -> CopyDbResult<()> {
    let parts = WorkUnit::table_parts(table.oid, table.partcount);
    if !ctx
        .coordinator
        .complete(CompletionGate::PartsDone, table.oid, &parts)
        .await?
    {
        return Ok(());
    }

    info!(table_id = %table.oid, qname = %table.qname, parts = parts.len(), "table copy done");

    let Some(index_queue) = &queues.indexes else {
        return Ok(());
    };

    copydb_fail_point(PARTS_DONE_BEFORE_ENQUEUE)?;

    let indexes = ctx.source().table_indexes(table.oid).await?;
    let units = index_units(table.oid, &indexes);
    if units.is_empty() {
        on_index_done(ctx, queues, table.oid, target).await?;
        return Ok(());
    }

    for unit in units {
        index_queue
            .send(QueueMessage::IndexOid {
                oid: unit.object_oid(),
            })
            .await?;
    }

    Ok(())
}

/// Runs after an index of table `table_oid` is done.
///
/// The single winner of the indexes-done gate builds the constraints of the table and enqueues
/// its vacuum. Returns whether this caller won.
pub async fn on_index_done<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    table_oid: Oid,
    target: &mut Option<C::Target>,
) -> CopyDbResult<bool> {
    let indexes = ctx.source().table_indexes(table_oid).await?;
    let units = index_units(table_oid, &indexes);
    if !ctx
        .coordinator
        .complete(CompletionGate::IndexesDone, table_oid, &units)
        .await?
    {
        return Ok(false);
    }

    finish_table(ctx, queues, table_oid, &indexes, target).await?;

    Ok(true)
}

/// Builds the constraints of a table whose indexes are all built, then enqueues its vacuum.
pub async fn finish_table<C: Connector>(
    ctx: &CopyContext<C>,
    queues: &FollowUpQueues,
    table_oid: Oid,
    indexes: &[SourceIndex],
    target: &mut Option<C::Target>,
) -> CopyDbResult<()> {
    let Some(table) = ctx.source().lookup_table_by_oid(table_oid).await? else {
        bail!(
            ErrorKind::InvalidData,
            "Table not found in the source catalog",
            format!("table_id: {table_oid}")
        );
    };

    info!(table_id = %table.oid, qname = %table.qname, indexes = indexes.len(), "table indexes done");

    for index in indexes {
        if let Some(constraint) = &index.constraint {
            build_constraint(ctx, &table, index, constraint, target).await?;
        }
    }

    if let Some(vacuum_queue) = &queues.vacuum {
        vacuum_queue
            .send(QueueMessage::TableOid {
                oid: table.oid,
                part: None,
            })
            .await?;
    }

    Ok(())
}

/// `ALTER TABLE` statement adding `constraint` on `table`.
///
/// Primary keys and unique constraints are attached to their already built index.
pub fn constraint_sql(
    table: &SourceTable,
    index: &SourceIndex,
    constraint: &SourceConstraint,
) -> String {
    let mut sql = if index.constraint_uses_index() {
        format!(
            "alter table only {} add constraint {} {} using index {}",
            table.qname,
            quote_identifier(&constraint.name),
            if index.is_primary { "primary key" } else { "unique" },
            quote_identifier(&index.relname),
        )
    } else {
        format!(
            "alter table only {} add constraint {} {}",
            table.qname,
            quote_identifier(&constraint.name),
            constraint.sql,
        )
    };

    if constraint.deferrable {
        sql.push_str(" deferrable");
    }
    if constraint.deferred {
        sql.push_str(" initially deferred");
    }

    sql
}

async fn build_constraint<C: Connector>(
    ctx: &CopyContext<C>,
    table: &SourceTable,
    index: &SourceIndex,
    constraint: &SourceConstraint,
    target: &mut Option<C::Target>,
) -> CopyDbResult<()> {
    let unit = WorkUnit::Constraint {
        table_oid: table.oid,
        constraint_oid: constraint.oid,
    };

    if ctx
        .catalogs
        .target
        .lookup_constraint_by_name(&table.nspname, &constraint.name)
        .await?
        .is_some()
    {
        info!(qname = %table.qname, constraint = %constraint.name, "constraint exists on target, skipping");
        ctx.coordinator.mark_done(unit, "constraint exists on target").await?;

        return Ok(());
    }

    let sql = constraint_sql(table, index, constraint);
    let claim = match ctx.coordinator.claim(unit, &sql).await? {
        ClaimOutcome::Claimed(claim) => claim,
        ClaimOutcome::AlreadyDone | ClaimOutcome::ClaimedByOther(_) => {
            debug!(qname = %table.qname, constraint = %constraint.name, "constraint handled elsewhere");
            return Ok(());
        }
    };

    ctx.source()
        .upsert_process_info(&ProcessInfo {
            pid: std::process::id(),
            worker: "constraint".to_owned(),
            ps_type: "CONSTRAINT".to_owned(),
            ps_title: format!("{} {}", table.qname, constraint.name),
            table_oid: Some(table.oid),
            partnum: None,
            index_oid: Some(index.oid),
        })
        .await?;

    let result = match connected_target(ctx, target).await {
        Ok(client) => client.execute(&sql).await,
        Err(err) => Err(err),
    };
    ctx.source()
        .delete_process(std::process::id(), "constraint")
        .await?;

    if let Err(err) = result {
        *target = None;
        return Err(err);
    }

    ctx.coordinator.finish(claim, 0).await?;
    ctx.source().increment_timing(Section::Constraints, 1, 0).await?;

    info!(qname = %table.qname, constraint = %constraint.name, "constraint created");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::concurrency::shutdown::{ShutdownResult, create_shutdown_channel};
    use crate::test_utils::memory::MemoryServer;
    use crate::test_utils::run::{TestRun, test_index, test_options, test_schema, test_table};

    fn table() -> SourceTable {
        SourceTable {
            oid: Oid(100),
            qname: "public.orders".to_owned(),
            nspname: "public".to_owned(),
            relname: "orders".to_owned(),
            ..Default::default()
        }
    }

    fn index(is_primary: bool, constraint: SourceConstraint) -> SourceIndex {
        SourceIndex {
            oid: Oid(101),
            qname: "public.orders_pkey".to_owned(),
            nspname: "public".to_owned(),
            relname: "orders_pkey".to_owned(),
            table_oid: Oid(100),
            is_primary,
            is_unique: true,
            constraint: Some(constraint),
            ..Default::default()
        }
    }

    #[test]
    fn primary_keys_reuse_their_index() {
        let constraint = SourceConstraint {
            oid: Oid(102),
            name: "orders_pkey".to_owned(),
            sql: "PRIMARY KEY (id)".to_owned(),
            ..Default::default()
        };
        let index = index(true, constraint.clone());

        assert_eq!(
            constraint_sql(&table(), &index, &constraint),
            "alter table only public.orders add constraint orders_pkey primary key using index orders_pkey"
        );
    }

    #[test]
    fn other_constraints_use_their_definition() {
        let constraint = SourceConstraint {
            oid: Oid(103),
            name: "orders no overlap".to_owned(),
            deferrable: true,
            deferred: true,
            sql: "EXCLUDE USING gist (during WITH &&)".to_owned(),
        };
        let mut index = index(false, constraint.clone());
        index.is_unique = false;

        assert_eq!(
            constraint_sql(&table(), &index, &constraint),
            "alter table only public.orders add constraint \"orders no overlap\" \
             EXCLUDE USING gist (during WITH &&) deferrable initially deferred"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn racing_index_follow_ups_enqueue_one_vacuum() {
        let run = TestRun::new().await;
        let items = test_table(16390, "public.items", 10);
        let index = test_index(16391, &items, "items_payload_idx", "payload");
        let server = MemoryServer::new(test_schema(
            vec![items.clone()],
            vec![index.clone()],
            Vec::new(),
        ));
        run.catalogs.source.add_table(&items).await.unwrap();
        run.catalogs.source.add_index(&index).await.unwrap();

        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let ctx = run.context(server.connector(), test_options(), shutdown_rx);
        let vacuum_queue = WorkQueue::create("vacuum", 8);
        let queues = FollowUpQueues {
            indexes: None,
            vacuum: Some(vacuum_queue.clone()),
        };

        let unit = WorkUnit::Index {
            table_oid: items.oid,
            index_oid: index.oid,
        };
        assert!(ctx.coordinator.mark_done(unit, "CREATE INDEX").await.unwrap());

        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ctx = ctx.clone();
            let queues = queues.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let mut target = None;
                on_index_done(&ctx, &queues, Oid(16390), &mut target)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        vacuum_queue.send_stops(1).await.unwrap();
        let (_tx, mut shutdown_rx) = create_shutdown_channel();
        let mut vacuums = Vec::new();
        loop {
            let message = vacuum_queue.receive(&mut shutdown_rx).await.unwrap();
            let ShutdownResult::Ok(message) = message else {
                panic!("unexpected shutdown");
            };
            if message == QueueMessage::Stop {
                break;
            }
            vacuums.push(message);
        }
        assert_eq!(
            vacuums,
            vec![QueueMessage::TableOid {
                oid: Oid(16390),
                part: None
            }]
        );
    }
}
