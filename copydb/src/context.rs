//! The state shared by the supervisors and workers of one run.

use std::sync::Arc;
use std::time::Duration;

use copydb_config::shared::CopyConfig;

use crate::catalog::{Catalog, Catalogs, Section};
use crate::clients::{Connector, SourceClient};
use crate::concurrency::shutdown::ShutdownRx;
use crate::coordination::{Coordinator, LiveClaims, ProcessLiveness, RunPaths};
use crate::error::CopyDbResult;

/// Attempts of a bulk copy failing with a connection exception.
const COPY_MAX_ATTEMPTS: u32 = 5;

/// Retries of a table copy interrupted by a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl CopyRetryPolicy {
    /// Sleep before attempt `attempt + 1`, doubling from the initial delay up to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for CopyRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: COPY_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run options, resolved from the configuration and the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub table_jobs: usize,
    pub index_jobs: usize,
    pub vacuum_jobs: usize,
    pub compare_jobs: usize,
    pub fail_fast: bool,
    pub resume: bool,
    pub skip_vacuum: bool,
    pub skip_extensions: bool,
    pub skip_collations: bool,
    pub consistent: bool,
    pub split_tables_larger_than: Option<u64>,
    pub split_max_parts: Option<u32>,
    pub queue_capacity: usize,
    /// What the run does; [`Section::All`] for a full clone.
    pub section: Section,
    pub retry: CopyRetryPolicy,
}

impl CopyOptions {
    pub fn from_config(config: &CopyConfig, section: Section) -> Self {
        Self {
            table_jobs: usize::from(config.table_jobs),
            index_jobs: usize::from(config.index_jobs),
            vacuum_jobs: usize::from(config.vacuum_jobs),
            compare_jobs: usize::from(config.compare_jobs),
            fail_fast: config.fail_fast,
            resume: config.resume,
            skip_vacuum: config.skip_vacuum,
            skip_extensions: config.skip_extensions,
            skip_collations: config.skip_collations,
            consistent: config.consistent,
            split_tables_larger_than: config.split_tables_larger_than,
            split_max_parts: config.split_max_parts,
            queue_capacity: config.queue_capacity,
            section,
            retry: CopyRetryPolicy::default(),
        }
    }

    /// Whether the run includes `section`.
    pub fn runs(&self, section: Section) -> bool {
        self.section == Section::All || self.section == section
    }

    /// Whether index and constraint DDL must tolerate objects created by a previous attempt.
    pub fn if_not_exists(&self) -> bool {
        self.resume || self.section == Section::Indexes
    }

    /// Whether copied tables trigger their index builds.
    pub fn builds_indexes(&self) -> bool {
        self.runs(Section::Indexes)
    }
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self::from_config(&CopyConfig::default(), Section::All)
    }
}

/// Catalogs, run directory, coordinator, connector and options of a run.
///
/// Cheap to clone: every worker owns a clone.
#[derive(Debug)]
pub struct CopyContext<C> {
    pub catalogs: Catalogs,
    pub paths: Arc<RunPaths>,
    pub coordinator: Coordinator,
    pub connector: Arc<C>,
    pub options: Arc<CopyOptions>,
    /// Snapshot every source client of the run reads from.
    pub snapshot: Option<Arc<str>>,
    pub shutdown_rx: ShutdownRx,
}

impl<C> Clone for CopyContext<C> {
    fn clone(&self) -> Self {
        Self {
            catalogs: self.catalogs.clone(),
            paths: self.paths.clone(),
            coordinator: self.coordinator.clone(),
            connector: self.connector.clone(),
            options: self.options.clone(),
            snapshot: self.snapshot.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }
}

impl<C> CopyContext<C>
where
    C: Connector,
{
    pub fn new(
        catalogs: Catalogs,
        paths: Arc<RunPaths>,
        connector: Arc<C>,
        options: CopyOptions,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let claims = LiveClaims::new();
        let coordinator = Coordinator::new(
            catalogs.source.clone(),
            paths.clone(),
            Arc::new(ProcessLiveness::current(claims.clone())),
            claims,
        );

        Self {
            catalogs,
            paths,
            coordinator,
            connector,
            options: Arc::new(options),
            snapshot: None,
            shutdown_rx,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<String>) -> Self {
        self.snapshot = snapshot.map(Arc::from);
        self
    }

    /// The source catalog, which also holds the coordination state.
    pub fn source(&self) -> &Catalog {
        &self.catalogs.source
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_rx.is_shutdown()
    }

    /// Connects to the source, reading from the run's snapshot when there is one.
    pub async fn connect_source(&self) -> CopyDbResult<C::Source> {
        let mut source = self.connector.connect_source().await?;
        if let Some(snapshot) = &self.snapshot {
            source.set_snapshot(snapshot).await?;
        }

        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_retries_back_off_up_to_the_cap() {
        let policy = CopyRetryPolicy::default();

        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn sections_select_the_run_steps() {
        let mut options = CopyOptions::default();
        assert!(options.runs(Section::TableData));
        assert!(options.builds_indexes());
        assert!(!options.if_not_exists());

        options.section = Section::TableData;
        assert!(!options.builds_indexes());

        options.section = Section::Indexes;
        assert!(options.if_not_exists());
    }
}
