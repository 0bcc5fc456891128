use copydb::catalog::{Section, Sentinel};
use copydb::clients::{Connector, PostgresConnector};
use copydb::pipeline::{Pipeline, PipelineConfig, SentinelUpdate};
use copydb::replay::{ReplayLoopResult, ReplayOptions, read_sql_changes};
use copydb::types::parse_lsn;
use copydb_config::shared::CopyDbConfig;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::args::{Command, ReplayArgs, SentinelCommand};
use crate::error::CliResult;

/// Runs `command` against the configured servers and work directory.
pub async fn run_command(command: Command, config: CopyDbConfig) -> CliResult<()> {
    log_config(&config);

    let section = match &command {
        Command::Copy { section } => Section::from(*section),
        _ => Section::All,
    };
    let connector = PostgresConnector::new(config.source.clone(), config.target.clone());
    let pipeline = Pipeline::new(
        PipelineConfig::from_config(&config, section),
        connector.clone(),
    );

    let shutdown_tx = pipeline.shutdown_tx();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, stopping after the current work units");
            // The run may have finished already, in which case nobody listens.
            let _ = shutdown_tx.shutdown();
        }
    });

    match command {
        Command::Clone | Command::Copy { .. } => {
            let report = pipeline.copy().await?;
            info!(
                tables = report.table_count,
                indexes = report.index_count,
                bytes = %report.bytes_pretty,
                "copy completed"
            );
            print_json(&report)?;
        }
        Command::Compare => {
            let comparisons = pipeline.compare().await?;
            let mut mismatches = 0;
            for comparison in &comparisons {
                if !comparison.matches() {
                    mismatches += 1;
                    warn!(
                        table = %comparison.qname,
                        source_rows = comparison.source.rowcount,
                        target_rows = comparison.target.rowcount,
                        "table data differs"
                    );
                }
            }
            print_json(&json!({
                "tables": comparisons.len(),
                "mismatches": mismatches,
            }))?;
        }
        Command::FilterToc { input, output } => {
            let summary = pipeline.filter_toc(&input, &output).await?;
            info!(
                restored = summary.restored,
                filtered = summary.filtered,
                processed = summary.processed,
                output = %output.display(),
                "wrote filtered restore list"
            );
        }
        Command::Replay(args) => replay(&pipeline, &connector, &config, args).await?,
        Command::Sentinel(command) => {
            let sentinel = match command {
                SentinelCommand::Get => pipeline.sentinel().await?,
                SentinelCommand::SetApply { apply } => Some(
                    pipeline
                        .update_sentinel(SentinelUpdate::Apply(apply))
                        .await?,
                ),
                SentinelCommand::SetStartpos { lsn } => Some(
                    pipeline
                        .update_sentinel(SentinelUpdate::Startpos(parse_lsn(&lsn)?))
                        .await?,
                ),
                SentinelCommand::SetEndpos { lsn } => Some(
                    pipeline
                        .update_sentinel(SentinelUpdate::Endpos(parse_lsn(&lsn)?))
                        .await?,
                ),
            };

            match sentinel {
                Some(sentinel) => print_json(&sentinel_json(&sentinel))?,
                None => warn!("replication is not configured in this work directory"),
            }
        }
        Command::Progress => print_json(&pipeline.progress().await?)?,
        Command::Clean { all } => {
            pipeline.clean(all).await?;
            info!(dir = %pipeline.paths().topdir.display(), "removed work directory");
        }
    }

    Ok(())
}

async fn replay(
    pipeline: &Pipeline<PostgresConnector>,
    connector: &PostgresConnector,
    config: &CopyDbConfig,
    args: ReplayArgs,
) -> CliResult<()> {
    let mut options = ReplayOptions::from_config(&config.replay)?;
    options.replay_mode |= args.replay;
    if let Some(endpos) = &args.endpos {
        options.endpos = Some(parse_lsn(endpos)?);
    }

    let events = read_sql_changes(&args.sql_file).await?;
    let applier = connector.connect_target().await?;
    let outcome = pipeline.replay(applier, events, options).await?;

    match outcome.result {
        ReplayLoopResult::Completed => info!(
            replay_lsn = %outcome.replay_lsn,
            transactions = outcome.transactions,
            "replay reached the end position"
        ),
        ReplayLoopResult::Paused => info!(
            replay_lsn = %outcome.replay_lsn,
            transactions = outcome.transactions,
            "replay paused"
        ),
    }

    Ok(())
}

fn sentinel_json(sentinel: &Sentinel) -> serde_json::Value {
    json!({
        "startpos": sentinel.startpos.to_string(),
        "endpos": sentinel.endpos.to_string(),
        "apply": sentinel.apply,
        "write_lsn": sentinel.write_lsn.to_string(),
        "flush_lsn": sentinel.flush_lsn.to_string(),
        "replay_lsn": sentinel.replay_lsn.to_string(),
    })
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);

    Ok(())
}

fn log_config(config: &CopyDbConfig) {
    info!(
        source = %config.source.identity(),
        target = ?config.target.as_ref().map(|target| target.identity()),
        dir = %config.run.dir.display(),
        table_jobs = config.copy.table_jobs,
        index_jobs = config.copy.index_jobs,
        resume = config.copy.resume,
        restart = config.copy.restart,
        "copydb configuration"
    );
}
