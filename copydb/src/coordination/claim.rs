//! The claim protocol.
//!
//! Every unit of work moves through `Unclaimed -> Claimed(claimant) -> Done`, and a claim of a
//! dead claimant goes back to `Unclaimed`. Decisions are taken while holding the source
//! catalog semaphore; the work itself runs outside of it. The marker files decide whether a
//! unit may start, the summary rows serve reporting and resume.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::catalog::{Catalog, CatalogTransaction, CompletionGate};
use crate::coordination::liveness::{ClaimTicket, LiveClaims, Liveness};
use crate::coordination::markers::{
    ClaimMarker, DoneMarker, create_marker, marker_exists, read_marker, remove_marker,
    write_marker,
};
use crate::coordination::paths::RunPaths;
use crate::coordination::unit::WorkUnit;
use crate::error::{CopyDbResult, ErrorKind};
use crate::failpoints::{
    CLAIM_AFTER_MARKER, FINISH_BEFORE_SUMMARY, copydb_fail_point,
};
use crate::types::{Claimant, Oid};

/// Result of trying to claim a unit.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The unit is ours until the claim is finished or dropped.
    Claimed(UnitClaim),
    AlreadyDone,
    /// A live claimant is working on the unit.
    ClaimedByOther(Claimant),
}

/// A held claim on a unit.
///
/// Dropping it without calling [`Coordinator::finish`] leaves the claim in place, and makes it
/// stale for every later claimer.
#[derive(Debug)]
pub struct UnitClaim {
    unit: WorkUnit,
    start: DateTime<Utc>,
    ticket: ClaimTicket,
}

impl UnitClaim {
    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    pub fn claimant(&self) -> &Claimant {
        self.ticket.claimant()
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }
}

/// Coordinates the units of a run over the source catalog and the run directory.
#[derive(Debug, Clone)]
pub struct Coordinator {
    catalog: Catalog,
    paths: Arc<RunPaths>,
    liveness: Arc<dyn Liveness>,
    claims: LiveClaims,
    pid: u32,
}

impl Coordinator {
    pub fn new(
        catalog: Catalog,
        paths: Arc<RunPaths>,
        liveness: Arc<dyn Liveness>,
        claims: LiveClaims,
    ) -> Self {
        Self {
            catalog,
            paths,
            liveness,
            claims,
            pid: std::process::id(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Claims `unit` for a new claimant of this process.
    pub async fn claim(&self, unit: WorkUnit, command: &str) -> CopyDbResult<ClaimOutcome> {
        let _permit = self.catalog.lock().await?;

        let done = self.paths.unit_done(&unit);
        if let Some(marker) = read_marker::<DoneMarker>(&done).await? {
            debug!(%unit, "unit already done, skipping");
            self.repair_summary(&marker, command).await?;
            return Ok(ClaimOutcome::AlreadyDone);
        }

        let lock = self.paths.unit_lock(&unit);
        match read_marker::<ClaimMarker>(&lock).await {
            Ok(Some(marker)) => {
                if self.liveness.is_alive(&marker.claimant) {
                    debug!(%unit, claimant = %marker.claimant, "unit claimed by a live claimant");
                    return Ok(ClaimOutcome::ClaimedByOther(marker.claimant));
                }

                warn!(
                    %unit,
                    claimant = %marker.claimant,
                    command = %marker.command,
                    "found stale claim, taking the unit over"
                );
                remove_marker(&lock).await?;
            }
            Ok(None) => {}
            // A claimant that crashed while writing leaves a marker nobody can own.
            Err(err) if err.kind() == ErrorKind::InvalidMarker => {
                warn!(%unit, error = %err, "found unreadable claim, taking the unit over");
                remove_marker(&lock).await?;
            }
            Err(err) => return Err(err),
        }

        let claimant = Claimant {
            pid: self.pid,
            token: uuid::Uuid::new_v4(),
        };
        let ticket = self.claims.register(claimant);
        let start = Utc::now();

        let marker = ClaimMarker {
            claimant,
            unit,
            command: command.to_string(),
            start_time_epoch: start.timestamp(),
        };
        if !create_marker(&lock, &marker).await? {
            // Another process created the marker after our read.
            let owner = read_marker::<ClaimMarker>(&lock)
                .await?
                .map_or(claimant, |marker| marker.claimant);
            debug!(%unit, claimant = %owner, "lost the claim race");

            return Ok(ClaimOutcome::ClaimedByOther(owner));
        }

        copydb_fail_point(CLAIM_AFTER_MARKER)?;

        let mut tx = self.catalog.begin().await?;
        tx.claim_summary(&unit, &claimant, start.timestamp(), command)
            .await?;
        tx.commit().await?;

        debug!(%unit, %claimant, "claimed unit");

        Ok(ClaimOutcome::Claimed(UnitClaim {
            unit,
            start,
            ticket,
        }))
    }

    /// Marks the claimed unit done and releases the claim.
    pub async fn finish(&self, claim: UnitClaim, bytes: u64) -> CopyDbResult<DoneMarker> {
        let _permit = self.catalog.lock().await?;

        let done = Utc::now();
        let marker = DoneMarker {
            claimant: *claim.claimant(),
            unit: claim.unit,
            start_time_epoch: claim.start.timestamp(),
            done_time_epoch: done.timestamp(),
            duration: (done - claim.start).num_milliseconds(),
            bytes,
        };
        write_marker(&self.paths.unit_done(&claim.unit), &marker).await?;

        copydb_fail_point(FINISH_BEFORE_SUMMARY)?;

        let mut tx = self.catalog.begin().await?;
        tx.finish_summary(&claim.unit, marker.done_time_epoch, marker.duration, bytes)
            .await?;
        tx.commit().await?;

        remove_marker(&self.paths.unit_lock(&claim.unit)).await?;

        debug!(unit = %claim.unit, duration_ms = marker.duration, bytes, "unit done");

        Ok(marker)
    }

    /// Completes the summary row of a unit whose claimant stopped after writing its done
    /// marker, and drops its leftover claim marker.
    async fn repair_summary(&self, marker: &DoneMarker, command: &str) -> CopyDbResult<()> {
        let mut tx = self.catalog.begin().await?;
        let summary = tx.lookup_summary(&marker.unit).await?;
        if summary.as_ref().is_some_and(|summary| summary.is_done()) {
            return tx.commit().await;
        }

        warn!(unit = %marker.unit, claimant = %marker.claimant, "completing summary of a finished unit");

        if summary.is_none() {
            tx.claim_summary(&marker.unit, &marker.claimant, marker.start_time_epoch, command)
                .await?;
        }
        tx.finish_summary(
            &marker.unit,
            marker.done_time_epoch,
            marker.duration,
            marker.bytes,
        )
        .await?;
        tx.commit().await?;

        remove_marker(&self.paths.unit_lock(&marker.unit)).await
    }

    /// Records an already-present object as done without claiming it first.
    pub async fn mark_done(&self, unit: WorkUnit, command: &str) -> CopyDbResult<bool> {
        match self.claim(unit, command).await? {
            ClaimOutcome::Claimed(claim) => {
                self.finish(claim, 0).await?;
                Ok(true)
            }
            ClaimOutcome::AlreadyDone | ClaimOutcome::ClaimedByOther(_) => Ok(false),
        }
    }

    pub async fn is_done(&self, unit: &WorkUnit) -> CopyDbResult<bool> {
        marker_exists(&self.paths.unit_done(unit)).await
    }

    /// Whether every unit of `units` is done.
    pub async fn all_done(&self, units: &[WorkUnit]) -> CopyDbResult<bool> {
        for unit in units {
            if !self.is_done(unit).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Elects the single winner of `gate` for `table_oid` once `units` are all done.
    ///
    /// Returns `true` for exactly one caller over the lifetime of the catalog.
    pub async fn complete(
        &self,
        gate: CompletionGate,
        table_oid: Oid,
        units: &[WorkUnit],
    ) -> CopyDbResult<bool> {
        let _permit = self.catalog.lock().await?;

        if !self.all_done(units).await? {
            return Ok(false);
        }

        let claimant = Claimant {
            pid: self.pid,
            token: uuid::Uuid::new_v4(),
        };

        let mut tx = self.catalog.begin().await?;
        let won = tx.register_completion(gate, table_oid, &claimant).await?;
        tx.commit().await?;

        if won {
            debug!(table_id = %table_oid, ?gate, "won completion gate");
        }

        Ok(won)
    }

    /// Opens a transaction on the coordination catalog while the caller holds its semaphore.
    pub async fn begin(&self) -> CopyDbResult<CatalogTransaction> {
        self.catalog.begin().await
    }
}
