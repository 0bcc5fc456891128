//! Follow-up work of tables whose copy finished.
//!
//! A crash between electing the parts-done winner of a table and enqueueing its index builds
//! would leave the indexes unbuilt. Before the index workers are stopped, the table supervisor
//! re-checks every table and enqueues what is missing; duplicate messages are harmless as the
//! claim protocol skips finished units.

use tracing::info;

use crate::catalog::{CompletionGate, SourceIndex, SourceTable};
use crate::coordination::claim::Coordinator;
use crate::coordination::unit::WorkUnit;
use crate::error::CopyDbResult;
use crate::types::Oid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableFollowUp {
    /// The table copy is not finished, or its follow-up already ran.
    Nothing,
    /// These indexes still have to be built.
    BuildIndexes(Vec<Oid>),
    /// Every index is built and nobody won the indexes-done gate yet.
    IndexesDone,
    /// The indexes-done gate was won but some constraints are missing.
    ConstraintsMissing,
}

/// Index build units of `indexes`, leaving out the indexes created by their constraint.
pub fn index_units(table_oid: Oid, indexes: &[SourceIndex]) -> Vec<WorkUnit> {
    indexes
        .iter()
        .filter(|index| index.is_buildable())
        .map(|index| WorkUnit::Index {
            table_oid,
            index_oid: index.oid,
        })
        .collect()
}

/// Constraint units of `indexes`.
pub fn constraint_units(table_oid: Oid, indexes: &[SourceIndex]) -> Vec<WorkUnit> {
    indexes
        .iter()
        .filter_map(|index| index.constraint.as_ref())
        .map(|constraint| WorkUnit::Constraint {
            table_oid,
            constraint_oid: constraint.oid,
        })
        .collect()
}

impl Coordinator {
    /// Decides the missing follow-up of `table`.
    pub async fn reconcile_table(
        &self,
        table: &SourceTable,
        indexes: &[SourceIndex],
    ) -> CopyDbResult<TableFollowUp> {
        let parts = WorkUnit::table_parts(table.oid, table.partcount);
        if !self.all_done(&parts).await? {
            return Ok(TableFollowUp::Nothing);
        }

        let catalog = self.catalog();
        if catalog
            .lookup_completion(CompletionGate::IndexesDone, table.oid)
            .await?
            .is_some()
        {
            if self.all_done(&constraint_units(table.oid, indexes)).await? {
                return Ok(TableFollowUp::Nothing);
            }

            return Ok(TableFollowUp::ConstraintsMissing);
        }

        if self
            .complete(CompletionGate::PartsDone, table.oid, &parts)
            .await?
        {
            info!(table_id = %table.oid, qname = %table.qname, "elected missing parts-done winner");
        }

        let mut missing = Vec::new();
        for unit in index_units(table.oid, indexes) {
            if !self.is_done(&unit).await? {
                missing.push(unit.object_oid());
            }
        }

        if missing.is_empty() {
            Ok(TableFollowUp::IndexesDone)
        } else {
            Ok(TableFollowUp::BuildIndexes(missing))
        }
    }
}
