//! Entry points of a run: prepares the run directory and catalogs, then drives a copy, a
//! comparison, a TOC filter or a replay over them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use copydb_config::shared::{CopyDbConfig, FilterConfig};
use futures::Stream;
use tracing::{error, info, warn};

use crate::bail;
use crate::catalog::{Catalogs, FilterOptions, Section, Sentinel, SetupCheck, SetupRecord};
use crate::clients::{Connector, SourceClient, TargetClient};
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::context::{CopyContext, CopyOptions};
use crate::coordination::{PidFile, RunMode, RunPaths, RunState, prepare_run_dir};
use crate::error::{CopyDbResult, ErrorKind};
use crate::filter::{TocFilter, TocSummary, resolve_filters, write_filtered_toc};
use crate::progress::ProgressReport;
use crate::replay::{
    Applier, ReplayController, ReplayEvent, ReplayOptions, ReplayOutcome, load_timeline_history,
};
use crate::schema::{SchemaStats, SplitSettings, fetch_schema};
use crate::types::{PgLsn, invalid_lsn, is_valid_lsn};
use crate::workers::clone::run_copy;
use crate::workers::compare::{TableComparison, compare_data};

/// A change requested on the sentinel from outside the replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelUpdate {
    Apply(bool),
    Startpos(PgLsn),
    Endpos(PgLsn),
}

/// Settings of one run, resolved from the configuration and the command line.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dir: PathBuf,
    pub mode: RunMode,
    pub options: CopyOptions,
    pub filters: FilterConfig,
    /// Source connection without password, recorded in the setup record.
    pub source_identity: Option<String>,
    pub target_identity: Option<String>,
    /// Snapshot to import instead of exporting one.
    pub snapshot: Option<String>,
}

impl PipelineConfig {
    pub fn from_config(config: &CopyDbConfig, section: Section) -> Self {
        let mode = if config.copy.restart {
            RunMode::Restart
        } else if config.copy.resume {
            RunMode::Resume
        } else {
            RunMode::Fresh
        };

        Self {
            dir: config.run.dir.clone(),
            mode,
            options: CopyOptions::from_config(&config.copy, section),
            filters: config.filters.clone(),
            source_identity: Some(config.source.identity()),
            target_identity: config.target.as_ref().map(|target| target.identity()),
            snapshot: config.copy.snapshot.clone(),
        }
    }

    fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            skip_extensions: self.options.skip_extensions,
            skip_collations: self.options.skip_collations,
        }
    }

    fn setup_record(&self, snapshot: Option<&str>) -> CopyDbResult<SetupRecord> {
        Ok(SetupRecord {
            source_pg_uri: self.source_identity.clone(),
            target_pg_uri: self.target_identity.clone(),
            snapshot: snapshot.map(str::to_owned),
            split_tables_larger_than: self.options.split_tables_larger_than,
            split_max_parts: self.options.split_max_parts,
            filters: Some(serde_json::to_string(&self.filters)?),
            plugin: None,
            slot_name: None,
        })
    }
}

/// A prepared run: the pid file is held, the catalogs are populated and the context is ready.
///
/// When the run exported its snapshot, the exporting client is kept here, since the snapshot
/// can only be imported while its transaction stays open.
pub struct PreparedRun<C: Connector> {
    pub ctx: CopyContext<C>,
    pub state: RunState,
    /// `None` when the schema was fetched by a previous run.
    pub stats: Option<SchemaStats>,
    pub filters: u64,
    snapshot_holder: Option<C::Source>,
    _pid_file: PidFile,
}

impl<C: Connector> PreparedRun<C> {
    pub fn has_snapshot_holder(&self) -> bool {
        self.snapshot_holder.is_some()
    }

    /// Releases the snapshot and closes the catalogs; the pid file is removed on drop.
    pub async fn finish(self) {
        drop(self.snapshot_holder);
        self.ctx.catalogs.close().await;
    }
}

#[derive(Debug)]
pub struct Pipeline<C> {
    config: Arc<PipelineConfig>,
    paths: Arc<RunPaths>,
    connector: Arc<C>,
    shutdown_tx: ShutdownTx,
}

impl<C: Connector> Pipeline<C> {
    pub fn new(config: PipelineConfig, connector: C) -> Self {
        // Receivers are obtained through `subscribe`.
        let (shutdown_tx, _) = create_shutdown_channel();
        let paths = RunPaths::new(&config.dir);

        Self {
            config: Arc::new(config),
            paths: Arc::new(paths),
            connector: Arc::new(connector),
            shutdown_tx,
        }
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Prepares the run directory and the catalogs.
    ///
    /// Fetching the schema and preparing the filters are skipped when a previous run of the
    /// same directory already did them.
    pub async fn prepare(&self) -> CopyDbResult<PreparedRun<C>> {
        let config = &self.config;
        let pid_file = PidFile::acquire(&self.paths.pid_file).await?;
        let state = prepare_run_dir(&self.paths, config.mode).await?;

        let catalogs = Catalogs::new(&self.paths.schema_dir);
        catalogs.init().await?;

        let mut snapshot_holder = None;
        let snapshot = match &config.snapshot {
            Some(snapshot) => Some(snapshot.clone()),
            None if config.options.consistent => {
                let mut source = self.connector.connect_source().await?;
                let snapshot = source.export_snapshot().await?;
                tokio::fs::write(&self.paths.snapshot_file, format!("{snapshot}\n")).await?;
                info!(%snapshot, "exported snapshot");
                snapshot_holder = Some(source);
                Some(snapshot)
            }
            None => None,
        };

        let setup = config.setup_record(snapshot.as_deref())?;
        let check = SetupCheck {
            snapshot: config.options.consistent,
            split: true,
        };
        // The setup record lives in the source catalog only.
        catalogs.source.register_setup(&setup, check).await?;

        let stats = {
            let mut connected;
            let source = match snapshot_holder.as_mut() {
                Some(source) => source,
                None => {
                    connected = self.connector.connect_source().await?;
                    if let Some(snapshot) = &snapshot {
                        connected.set_snapshot(snapshot).await?;
                    }
                    &mut connected
                }
            };
            let split = SplitSettings::from_options(
                config.options.split_tables_larger_than,
                config.options.split_max_parts,
            );

            fetch_schema(
                &catalogs,
                source,
                &config.filters,
                config.filter_options(),
                split,
                &self.paths.schema_file,
            )
            .await?
        };

        let filters = resolve_filters(&catalogs, &config.filters, config.filter_options()).await?;

        if config.options.runs(Section::Indexes) || config.options.runs(Section::Constraints) {
            self.fetch_target_catalog(&catalogs).await?;
        }

        if let Some(stats) = &stats {
            info!(
                tables = stats.tables,
                table_parts = stats.table_parts,
                indexes = stats.indexes,
                sequences = stats.sequences,
                excluded_tables = stats.excluded_tables,
                filters,
                "prepared run"
            );
        }

        let mut options = config.options.clone();
        options.resume = config.mode == RunMode::Resume;

        let ctx = CopyContext::new(
            catalogs,
            self.paths.clone(),
            self.connector.clone(),
            options,
            self.shutdown_tx.subscribe(),
        )
        .with_snapshot(snapshot);

        Ok(PreparedRun {
            ctx,
            state,
            stats,
            filters,
            snapshot_holder,
            _pid_file: pid_file,
        })
    }

    /// Records the indexes and constraints already present on the target.
    async fn fetch_target_catalog(&self, catalogs: &Catalogs) -> CopyDbResult<()> {
        let target_catalog = &catalogs.target;
        if target_catalog.section(Section::Indexes).await?.fetched {
            return Ok(());
        }

        let start = Utc::now();
        let mut target = self.connector.connect_target().await?;
        let indexes = target.fetch_indexes().await?;
        for index in &indexes {
            target_catalog.add_index(index).await?;
        }
        target_catalog
            .mark_section_fetched(Section::Indexes, start, Utc::now())
            .await?;

        info!(indexes = indexes.len(), "fetched target indexes");

        Ok(())
    }

    /// Copies the data, indexes, constraints and sequences of the retained tables.
    pub async fn copy(&self) -> CopyDbResult<ProgressReport> {
        let prepared = self.prepare().await?;

        if prepared.state.is_complete() && self.config.mode == RunMode::Resume {
            info!("previous run already completed every phase");
        }

        let result = run_copy(prepared.ctx.clone(), prepared.state).await;
        if let Err(err) = &result {
            error!(error = %err, "copy failed");
        }
        prepared.finish().await;

        result
    }

    /// Compares the data of the retained tables on both sides.
    pub async fn compare(&self) -> CopyDbResult<Vec<TableComparison>> {
        let prepared = self.prepare().await?;
        let result = compare_data(&prepared.ctx).await;
        prepared.finish().await;

        result
    }

    /// Writes the `pg_restore` list `input` to `output` with filtered entries, and the indexes
    /// and constraints the copy already built, commented out.
    pub async fn filter_toc(&self, input: &Path, output: &Path) -> CopyDbResult<TocSummary> {
        let prepared = self.prepare().await?;
        let result: CopyDbResult<TocSummary> = async {
            let filter = TocFilter::new(&prepared.ctx.catalogs.filter)
                .skip_processed(&prepared.ctx.coordinator)
                .await?;
            write_filtered_toc(&filter, input, output).await
        }
        .await;
        prepared.finish().await;

        result
    }

    /// Applies the change stream `events` to the target through `applier`.
    ///
    /// The sentinel is created on first use, starting at the current source position.
    pub async fn replay<A, S>(
        &self,
        applier: A,
        events: S,
        options: ReplayOptions,
    ) -> CopyDbResult<ReplayOutcome>
    where
        A: Applier,
        S: Stream<Item = CopyDbResult<ReplayEvent>> + Send,
    {
        self.paths.create_dirs().await?;
        let catalogs = Catalogs::new(&self.paths.schema_dir);
        catalogs.init().await?;
        let catalog = catalogs.source.clone();

        if catalog.sentinel().await?.is_none() {
            let mut source = self.connector.connect_source().await?;
            let startpos = source.current_wal_lsn().await?;
            let endpos = options.endpos.unwrap_or_else(invalid_lsn);
            catalog.setup_sentinel(startpos, endpos).await?;
            info!(%startpos, endpos = %endpos, "created sentinel");
        }

        if tokio::fs::try_exists(&self.paths.cdc.tli).await? {
            load_timeline_history(&catalog, &self.paths.cdc).await?;
        }

        let controller = ReplayController::new(
            catalog,
            applier,
            options,
            self.shutdown_tx.subscribe(),
        );
        let outcome = controller.run(events).await;
        catalogs.close().await;

        let outcome = outcome?;
        if !is_valid_lsn(outcome.replay_lsn) {
            warn!("replay stopped before applying any transaction");
        }

        Ok(outcome)
    }

    /// Opens the catalogs of an existing run directory.
    async fn open_catalogs(&self) -> CopyDbResult<Catalogs> {
        let catalogs = Catalogs::new(&self.paths.schema_dir);
        catalogs.open().await?;

        Ok(catalogs)
    }

    /// Progress of the run in this directory, readable while it runs.
    pub async fn progress(&self) -> CopyDbResult<ProgressReport> {
        let catalogs = self.open_catalogs().await?;
        let report = ProgressReport::collect(&catalogs.source).await;
        catalogs.close().await;

        report
    }

    pub async fn sentinel(&self) -> CopyDbResult<Option<Sentinel>> {
        let catalogs = self.open_catalogs().await?;
        let sentinel = catalogs.source.sentinel().await;
        catalogs.close().await;

        sentinel
    }

    /// Applies `update` to the sentinel and returns its new state.
    pub async fn update_sentinel(&self, update: SentinelUpdate) -> CopyDbResult<Sentinel> {
        let catalogs = self.open_catalogs().await?;
        let result: CopyDbResult<Sentinel> = async {
            let catalog = &catalogs.source;
            match update {
                SentinelUpdate::Apply(apply) => catalog.update_sentinel_apply(apply).await?,
                SentinelUpdate::Startpos(lsn) => catalog.update_sentinel_startpos(lsn).await?,
                SentinelUpdate::Endpos(lsn) => catalog.update_sentinel_endpos(lsn).await?,
            }

            match catalog.sentinel().await? {
                Some(sentinel) => Ok(sentinel),
                None => bail!(
                    ErrorKind::InvalidState,
                    "Replication is not configured",
                    "the sentinel must be set up before it is updated"
                ),
            }
        }
        .await;
        catalogs.close().await;

        if let Ok(sentinel) = &result {
            info!(?update, apply = sentinel.apply, endpos = %sentinel.endpos, "updated sentinel");
        }

        result
    }

    /// Removes the run directory, keeping the CDC files unless `include_cdc` is set.
    pub async fn clean(&self, include_cdc: bool) -> CopyDbResult<()> {
        let _pid_file = PidFile::acquire(&self.paths.pid_file).await?;
        self.paths.clean(include_cdc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::memory::MemoryServer;
    use crate::test_utils::run::{test_options, test_schema, test_table};

    fn config(dir: &Path, mode: RunMode) -> PipelineConfig {
        PipelineConfig {
            dir: dir.to_path_buf(),
            mode,
            options: CopyOptions {
                section: Section::All,
                ..test_options()
            },
            filters: FilterConfig::default(),
            source_identity: Some("postgres://app@source.local/app".to_owned()),
            target_identity: Some("postgres://app@target.local/app".to_owned()),
            snapshot: None,
        }
    }

    #[tokio::test]
    async fn prepare_registers_the_setup_on_fresh_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryServer::new(test_schema(
            vec![test_table(16384, "public.items", 100)],
            Vec::new(),
            Vec::new(),
        ));

        let pipeline = Pipeline::new(config(dir.path(), RunMode::Fresh), server.connector());
        let prepared = pipeline.prepare().await.unwrap();
        assert_eq!(prepared.stats.as_ref().map(|stats| stats.tables), Some(1));

        let setup = prepared
            .ctx
            .catalogs
            .source
            .fetch_setup()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            setup.source_pg_uri.as_deref(),
            Some("postgres://app@source.local/app")
        );
        prepared.finish().await;

        // A resumed run checks the record instead of inserting it again.
        let pipeline = Pipeline::new(config(dir.path(), RunMode::Resume), server.connector());
        let prepared = pipeline.prepare().await.unwrap();
        assert!(prepared.stats.is_none());
        prepared.finish().await;
    }
}
