use chrono::Utc;
use tracing::{debug, info};

use crate::catalog::Section;
use crate::clients::{Connector, SourceClient, TargetClient};
use crate::context::CopyContext;
use crate::coordination::Phase;
use crate::coordination::markers::{PhaseMarker, marker_exists, write_marker};
use crate::error::CopyDbResult;

/// Reads the position of every sequence of the source catalog and sets it on the target.
///
/// Runs once per run directory: a finished reset leaves a phase marker that later resumes skip.
pub async fn reset_sequences<C: Connector>(ctx: &CopyContext<C>) -> CopyDbResult<u64> {
    let marker = ctx.paths.phase_done(Phase::Sequences);
    if marker_exists(&marker).await? {
        info!("sequences already reset");
        return Ok(0);
    }

    let catalog = ctx.source();
    let mut sequences = catalog.sequences().await?;
    sequences.dedup_by_key(|sequence| sequence.oid);
    let start = Utc::now();
    catalog.start_timing(Section::SetSequences, start).await?;

    let mut source = ctx.connect_source().await?;
    let mut target = ctx.connector.connect_target().await?;

    let mut count = 0;
    for mut sequence in sequences {
        if ctx.is_shutdown() {
            info!(count, "sequence reset interrupted by shutdown");
            return Ok(count);
        }

        let (last_value, is_called) = source.sequence_value(&sequence.qname).await?;
        catalog
            .update_sequence_values(sequence.oid, last_value, is_called)
            .await?;

        sequence.last_value = last_value;
        sequence.is_called = is_called;
        target.execute(&sequence.setval_sql()).await?;

        debug!(qname = %sequence.qname, last_value, is_called, "sequence reset");
        count += 1;
    }

    catalog.increment_timing(Section::SetSequences, count, 0).await?;
    catalog
        .finish_timing(Section::SetSequences, start, Utc::now())
        .await?;
    write_marker(
        &marker,
        &PhaseMarker {
            done_time_epoch: Utc::now().timestamp(),
            units: count,
        },
    )
    .await?;

    info!(count, "sequences reset");

    Ok(count)
}
