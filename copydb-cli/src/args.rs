use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use copydb::catalog::Section;
use copydb_config::shared::CopyDbConfig;

#[derive(Debug, Parser)]
#[command(name = "copydb", version, about = "Copies a Postgres database to another server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Overrides of the loaded configuration, shared by every command.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Configuration directory, `./configuration` when omitted
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Work directory of the run
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Also write logs to daily rolling files in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Continue the previous run, skipping the work it already did
    #[arg(long, global = true, conflicts_with = "restart")]
    pub resume: bool,

    /// Remove the previous run state before starting
    #[arg(long, global = true)]
    pub restart: bool,

    /// Abort the run on the first failed work unit
    #[arg(long, global = true)]
    pub fail_fast: bool,

    #[arg(long, global = true)]
    pub table_jobs: Option<u16>,

    #[arg(long, global = true)]
    pub index_jobs: Option<u16>,

    #[arg(long, global = true)]
    pub vacuum_jobs: Option<u16>,

    #[arg(long, global = true)]
    pub compare_jobs: Option<u16>,

    /// Copy every table from the same exported snapshot
    #[arg(long, global = true)]
    pub consistent: bool,

    /// Snapshot to import instead of exporting one
    #[arg(long, global = true, requires = "consistent")]
    pub snapshot: Option<String>,

    /// Split tables larger than this many bytes into parts
    #[arg(long, global = true)]
    pub split_tables_larger_than: Option<u64>,

    #[arg(long, global = true)]
    pub split_max_parts: Option<u32>,

    #[arg(long, global = true)]
    pub skip_vacuum: bool,

    #[arg(long, global = true)]
    pub skip_extensions: bool,

    #[arg(long, global = true)]
    pub skip_collations: bool,
}

impl RunArgs {
    /// Applies the flags given on the command line on top of `config`.
    pub fn apply(&self, config: &mut CopyDbConfig) {
        if let Some(dir) = &self.dir {
            config.run.dir = dir.clone();
        }
        if let Some(log_dir) = &self.log_dir {
            config.run.log_dir = Some(log_dir.clone());
        }

        let copy = &mut config.copy;
        copy.resume |= self.resume;
        copy.restart |= self.restart;
        copy.fail_fast |= self.fail_fast;
        copy.consistent |= self.consistent;
        copy.skip_vacuum |= self.skip_vacuum;
        copy.skip_extensions |= self.skip_extensions;
        copy.skip_collations |= self.skip_collations;

        for (value, jobs) in [
            (self.table_jobs, &mut copy.table_jobs),
            (self.index_jobs, &mut copy.index_jobs),
            (self.vacuum_jobs, &mut copy.vacuum_jobs),
            (self.compare_jobs, &mut copy.compare_jobs),
        ] {
            if let Some(value) = value {
                *jobs = value;
            }
        }

        if self.snapshot.is_some() {
            copy.snapshot = self.snapshot.clone();
        }
        if self.split_tables_larger_than.is_some() {
            copy.split_tables_larger_than = self.split_tables_larger_than;
        }
        if self.split_max_parts.is_some() {
            copy.split_max_parts = self.split_max_parts;
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy the data, indexes, constraints and sequences of every retained table
    Clone,

    /// Run a single section of the copy
    Copy {
        #[arg(value_enum)]
        section: CopySection,
    },

    /// Compare row counts and checksums of the retained tables on both servers
    Compare,

    /// Comment out the filtered and already built entries of a pg_restore list
    FilterToc {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,
    },

    /// Apply a transformed change file to the target
    Replay(ReplayArgs),

    /// Read or update the replication sentinel
    #[command(subcommand)]
    Sentinel(SentinelCommand),

    /// Print the progress of the run as JSON
    Progress,

    /// Remove the work directory
    Clean {
        /// Also remove the change data capture files
        #[arg(long)]
        all: bool,
    },
}

/// Sections that can be run on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CopySection {
    TableData,
    Indexes,
    Constraints,
    Sequences,
    Vacuum,
}

impl From<CopySection> for Section {
    fn from(section: CopySection) -> Self {
        match section {
            CopySection::TableData => Section::TableData,
            CopySection::Indexes => Section::Indexes,
            CopySection::Constraints => Section::Constraints,
            CopySection::Sequences => Section::SetSequences,
            CopySection::Vacuum => Section::Vacuum,
        }
    }
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Change file to apply
    #[arg(long)]
    pub sql_file: PathBuf,

    /// Stop once this source position is applied, in `X/X` form
    #[arg(long)]
    pub endpos: Option<String>,

    /// Apply without waiting for the sentinel apply flag
    #[arg(long)]
    pub replay: bool,
}

#[derive(Debug, Subcommand)]
pub enum SentinelCommand {
    /// Print the sentinel
    Get,

    /// Allow or forbid applying changes
    SetApply {
        #[arg(action = clap::ArgAction::Set)]
        apply: bool,
    },

    SetStartpos { lsn: String },

    SetEndpos { lsn: String },
}
