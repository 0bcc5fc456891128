use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Default bound of every work queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const fn default_jobs() -> u16 {
    4
}

const fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Settings of the bulk copy phases.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyConfig {
    /// Number of concurrent table COPY workers.
    #[serde(default = "default_jobs")]
    pub table_jobs: u16,
    /// Number of concurrent CREATE INDEX workers.
    #[serde(default = "default_jobs")]
    pub index_jobs: u16,
    /// Number of concurrent VACUUM ANALYZE workers.
    #[serde(default = "default_jobs")]
    pub vacuum_jobs: u16,
    /// Number of concurrent checksum workers used by compare.
    #[serde(default = "default_jobs")]
    pub compare_jobs: u16,
    /// Abort the whole run on the first failed work unit.
    #[serde(default)]
    pub fail_fast: bool,
    /// Continue a previous run, skipping work units already marked done.
    #[serde(default)]
    pub resume: bool,
    /// Remove the previous run state before starting.
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub skip_vacuum: bool,
    /// Leave extensions out of the restored schema.
    #[serde(default)]
    pub skip_extensions: bool,
    /// Leave non-default collations out of the restored schema.
    #[serde(default)]
    pub skip_collations: bool,
    /// Copy every table from the same exported snapshot.
    #[serde(default)]
    pub consistent: bool,
    /// Snapshot identifier to reuse instead of exporting a new one.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Tables larger than this many bytes are split into parts.
    #[serde(default)]
    pub split_tables_larger_than: Option<u64>,
    /// Upper bound on the number of parts of one table.
    #[serde(default)]
    pub split_max_parts: Option<u32>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl CopyConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, jobs) in [
            ("table_jobs", self.table_jobs),
            ("index_jobs", self.index_jobs),
            ("vacuum_jobs", self.vacuum_jobs),
            ("compare_jobs", self.compare_jobs),
        ] {
            if jobs == 0 {
                return Err(ValidationError::JobsZero(name));
            }
        }

        if self.queue_capacity == 0 {
            return Err(ValidationError::QueueCapacityZero);
        }

        if self.split_tables_larger_than.is_some() && self.split_max_parts.is_some_and(|p| p < 2)
        {
            return Err(ValidationError::SplitMaxPartsTooSmall);
        }

        if self.snapshot.is_some() && !self.consistent {
            return Err(ValidationError::SnapshotWithoutConsistent);
        }

        if self.resume && self.restart {
            return Err(ValidationError::ResumeAndRestart);
        }

        Ok(())
    }
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            table_jobs: default_jobs(),
            index_jobs: default_jobs(),
            vacuum_jobs: default_jobs(),
            compare_jobs: default_jobs(),
            fail_fast: false,
            resume: false,
            restart: false,
            skip_vacuum: false,
            skip_extensions: false,
            skip_collations: false,
            consistent: false,
            snapshot: None,
            split_tables_larger_than: None,
            split_max_parts: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}
