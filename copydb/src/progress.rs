//! Read-only progress and summary reporting over the source catalog.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::catalog::{
    Catalog, ProcessInfo, SourceIndex, SourceTable, SummaryCounts, TimingRecord,
};
use crate::coordination::markers::write_marker;
use crate::error::CopyDbResult;

const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// Formats a byte count with a binary multiple, as in `12 MB` or `1.5 GB`.
pub fn pretty_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 || value >= 10.0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// A table whose copy is running.
#[derive(Debug, Clone, Serialize)]
pub struct TableProgress {
    pub oid: u32,
    pub qname: String,
    pub bytes: u64,
    pub bytes_pretty: String,
    pub partcount: u32,
}

impl From<&SourceTable> for TableProgress {
    fn from(table: &SourceTable) -> Self {
        Self {
            oid: table.oid.into_inner(),
            qname: table.qname.clone(),
            bytes: table.bytes,
            bytes_pretty: pretty_bytes(table.bytes),
            partcount: table.partcount,
        }
    }
}

/// An index whose build is running.
#[derive(Debug, Clone, Serialize)]
pub struct IndexProgress {
    pub oid: u32,
    pub qname: String,
    pub table_oid: u32,
}

impl From<&SourceIndex> for IndexProgress {
    fn from(index: &SourceIndex) -> Self {
        Self {
            oid: index.oid.into_inner(),
            qname: index.qname.clone(),
            table_oid: index.table_oid.into_inner(),
        }
    }
}

/// Snapshot of a run's progress, as written to `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub generated_at: DateTime<Utc>,
    pub table_count: u64,
    pub index_count: u64,
    pub done: SummaryCounts,
    pub bytes_pretty: String,
    pub tables_in_progress: Vec<TableProgress>,
    pub indexes_in_progress: Vec<IndexProgress>,
    pub processes: Vec<ProcessInfo>,
    pub timings: Vec<TimingRecord>,
}

impl ProgressReport {
    pub async fn collect(catalog: &Catalog) -> CopyDbResult<Self> {
        let done = catalog.count_summary_done().await?;

        Ok(Self {
            generated_at: Utc::now(),
            table_count: catalog.count_tables().await?,
            index_count: catalog.count_indexes().await?,
            done,
            bytes_pretty: pretty_bytes(done.bytes),
            tables_in_progress: catalog
                .tables_in_copy()
                .await?
                .iter()
                .map(TableProgress::from)
                .collect(),
            indexes_in_progress: catalog
                .indexes_in_progress()
                .await?
                .iter()
                .map(IndexProgress::from)
                .collect(),
            processes: catalog.processes().await?,
            timings: catalog.timings().await?,
        })
    }

    /// Writes the report as JSON, replacing any previous one.
    pub async fn write(&self, path: &Path) -> CopyDbResult<()> {
        write_marker(path, self).await?;

        info!(
            path = %path.display(),
            table_parts = self.done.table_parts,
            indexes = self.done.indexes,
            constraints = self.done.constraints,
            bytes = %self.bytes_pretty,
            "wrote run summary"
        );

        Ok(())
    }
}
