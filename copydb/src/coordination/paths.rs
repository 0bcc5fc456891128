//! Layout of the run directory.
//!
//! ```text
//! <topdir>/
//!   copydb.pid
//!   snapshot
//!   schema.json
//!   summary.json
//!   schema/{source,filter,target}.db
//!   run/<table oid>[.<part>]                claim markers of table copies
//!   run/tables/<table oid>[.<part>].done
//!   run/indexes/<index oid>[.done]
//!   run/constraints/<constraint oid>[.done]
//!   run/{tables,indexes,sequences,vacuum}.done
//!   cdc/                                    survives `clean` unless asked
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::coordination::unit::WorkUnit;
use crate::error::CopyDbResult;

/// A phase whose completion is recorded by a done marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Tables,
    Indexes,
    Sequences,
    Vacuum,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Tables, Phase::Indexes, Phase::Sequences, Phase::Vacuum];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Tables => "tables",
            Phase::Indexes => "indexes",
            Phase::Sequences => "sequences",
            Phase::Vacuum => "vacuum",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Files of the change-data-capture phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdcPaths {
    pub dir: PathBuf,
    pub origin: PathBuf,
    pub slot: PathBuf,
    pub wal_segment_size: PathBuf,
    pub tli: PathBuf,
    pub tli_history: PathBuf,
}

impl CdcPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();

        Self {
            origin: dir.join("origin"),
            slot: dir.join("slot"),
            wal_segment_size: dir.join("wal_segment_size"),
            tli: dir.join("tli"),
            tli_history: dir.join("tli.history"),
            dir,
        }
    }
}

/// Every path of a run, computed from its top directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub topdir: PathBuf,
    pub pid_file: PathBuf,
    pub snapshot_file: PathBuf,
    pub schema_file: PathBuf,
    pub summary_file: PathBuf,
    pub schema_dir: PathBuf,
    pub run_dir: PathBuf,
    pub tables_dir: PathBuf,
    pub indexes_dir: PathBuf,
    pub constraints_dir: PathBuf,
    pub cdc: CdcPaths,
}

impl RunPaths {
    pub fn new(topdir: impl Into<PathBuf>) -> Self {
        let topdir = topdir.into();
        let run_dir = topdir.join("run");

        Self {
            pid_file: topdir.join("copydb.pid"),
            snapshot_file: topdir.join("snapshot"),
            schema_file: topdir.join("schema.json"),
            summary_file: topdir.join("summary.json"),
            schema_dir: topdir.join("schema"),
            tables_dir: run_dir.join("tables"),
            indexes_dir: run_dir.join("indexes"),
            constraints_dir: run_dir.join("constraints"),
            cdc: CdcPaths::new(topdir.join("cdc")),
            run_dir,
            topdir,
        }
    }

    /// Creates every directory of the layout.
    pub async fn create_dirs(&self) -> CopyDbResult<()> {
        for dir in [
            &self.schema_dir,
            &self.tables_dir,
            &self.indexes_dir,
            &self.constraints_dir,
            &self.cdc.dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }

        Ok(())
    }

    /// Claim marker of `unit`.
    pub fn unit_lock(&self, unit: &WorkUnit) -> PathBuf {
        match *unit {
            WorkUnit::TablePart { table_oid, partnum } => {
                self.run_dir.join(part_file_name(table_oid.into_inner(), partnum))
            }
            WorkUnit::Index { index_oid, .. } => self.indexes_dir.join(index_oid.to_string()),
            WorkUnit::Constraint { constraint_oid, .. } => {
                self.constraints_dir.join(constraint_oid.to_string())
            }
        }
    }

    /// Done marker of `unit`.
    pub fn unit_done(&self, unit: &WorkUnit) -> PathBuf {
        match *unit {
            WorkUnit::TablePart { table_oid, partnum } => self.tables_dir.join(format!(
                "{}.done",
                part_file_name(table_oid.into_inner(), partnum)
            )),
            WorkUnit::Index { index_oid, .. } => {
                self.indexes_dir.join(format!("{index_oid}.done"))
            }
            WorkUnit::Constraint { constraint_oid, .. } => {
                self.constraints_dir.join(format!("{constraint_oid}.done"))
            }
        }
    }

    pub fn phase_done(&self, phase: Phase) -> PathBuf {
        self.run_dir.join(format!("{}.done", phase.as_str()))
    }

    /// Removes the run directory, keeping the pid file and the CDC files unless `include_cdc`.
    pub async fn clean(&self, include_cdc: bool) -> CopyDbResult<()> {
        if !tokio::fs::try_exists(&self.topdir).await? {
            return Ok(());
        }

        if include_cdc {
            tokio::fs::remove_dir_all(&self.topdir).await?;
        } else {
            let mut entries = tokio::fs::read_dir(&self.topdir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path == self.cdc.dir || path == self.pid_file {
                    continue;
                }

                if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }

        info!(topdir = %self.topdir.display(), include_cdc, "cleaned run directory");

        Ok(())
    }
}

fn part_file_name(table_oid: u32, partnum: u32) -> String {
    if partnum == 0 {
        table_oid.to_string()
    } else {
        format!("{table_oid}.{partnum}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Oid;

    #[test]
    fn unit_markers_follow_the_layout() {
        let paths = RunPaths::new("/tmp/copydb");

        let whole = WorkUnit::whole_table(Oid(16_384));
        assert_eq!(paths.unit_lock(&whole), PathBuf::from("/tmp/copydb/run/16384"));
        assert_eq!(
            paths.unit_done(&whole),
            PathBuf::from("/tmp/copydb/run/tables/16384.done")
        );

        let part = WorkUnit::TablePart {
            table_oid: Oid(16_384),
            partnum: 3,
        };
        assert_eq!(paths.unit_lock(&part), PathBuf::from("/tmp/copydb/run/16384.3"));
        assert_eq!(
            paths.unit_done(&part),
            PathBuf::from("/tmp/copydb/run/tables/16384.3.done")
        );

        let index = WorkUnit::Index {
            table_oid: Oid(16_384),
            index_oid: Oid(16_400),
        };
        assert_eq!(
            paths.unit_done(&index),
            PathBuf::from("/tmp/copydb/run/indexes/16400.done")
        );
        assert_eq!(
            paths.phase_done(Phase::Vacuum),
            PathBuf::from("/tmp/copydb/run/vacuum.done")
        );
    }

    #[tokio::test]
    async fn clean_keeps_cdc_files_unless_asked() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path().join("run"));
        paths.create_dirs().await.unwrap();
        tokio::fs::write(&paths.cdc.slot, "copydb").await.unwrap();
        tokio::fs::write(&paths.snapshot_file, "00000003-1").await.unwrap();

        paths.clean(false).await.unwrap();
        assert!(tokio::fs::try_exists(&paths.cdc.slot).await.unwrap());
        assert!(!tokio::fs::try_exists(&paths.snapshot_file).await.unwrap());
        assert!(!tokio::fs::try_exists(&paths.run_dir).await.unwrap());

        paths.clean(true).await.unwrap();
        assert!(!tokio::fs::try_exists(&paths.topdir).await.unwrap());
    }
}
