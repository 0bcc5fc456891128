//! Pid file and resume state of a run directory.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bail;
use crate::coordination::liveness::pid_is_alive;
use crate::coordination::markers::marker_exists;
use crate::coordination::paths::{Phase, RunPaths};
use crate::error::{CopyDbResult, ErrorKind};

/// The pid file of a running copy.
///
/// Removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Writes the current pid to `path`.
    ///
    /// Fails with [`ErrorKind::DuplicateRun`] while another live process holds the file; the
    /// file of a dead process is taken over.
    pub async fn acquire(path: &Path) -> CopyDbResult<PidFile> {
        let pid = std::process::id();

        match tokio::fs::read_to_string(path).await {
            Ok(content) => match content.lines().next().map(str::trim).map(str::parse::<u32>) {
                Some(Ok(owner)) if owner != pid && pid_is_alive(owner) => {
                    bail!(
                        ErrorKind::DuplicateRun,
                        "Another copy is already running in this directory",
                        format!("pid file: {}, pid: {owner}", path.display())
                    );
                }
                Some(Ok(owner)) => {
                    warn!(pid = owner, path = %path.display(), "removing stale pid file");
                }
                _ => {
                    warn!(path = %path.display(), "removing unreadable pid file");
                }
            },
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, format!("{pid}\n")).await?;

        debug!(pid, path = %path.display(), "wrote pid file");

        Ok(PidFile {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != IoErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove pid file");
            }
        }
    }
}

/// How a run treats an existing run directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Refuse to reuse a directory holding the state of a previous run.
    Fresh,
    /// Continue the previous run, skipping finished work.
    Resume,
    /// Remove the previous state, except the CDC files, and start over.
    Restart,
}

/// Which phases of a previous run were completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunState {
    pub schema_fetched: bool,
    pub tables_done: bool,
    pub indexes_done: bool,
    pub sequences_done: bool,
    pub vacuum_done: bool,
}

impl RunState {
    pub async fn inspect(paths: &RunPaths) -> CopyDbResult<RunState> {
        Ok(RunState {
            schema_fetched: marker_exists(&paths.schema_dir.join("source.db")).await?,
            tables_done: marker_exists(&paths.phase_done(Phase::Tables)).await?,
            indexes_done: marker_exists(&paths.phase_done(Phase::Indexes)).await?,
            sequences_done: marker_exists(&paths.phase_done(Phase::Sequences)).await?,
            vacuum_done: marker_exists(&paths.phase_done(Phase::Vacuum)).await?,
        })
    }

    pub fn has_previous_run(&self) -> bool {
        self.schema_fetched
            || self.tables_done
            || self.indexes_done
            || self.sequences_done
            || self.vacuum_done
    }

    pub fn is_complete(&self) -> bool {
        self.tables_done && self.indexes_done && self.sequences_done && self.vacuum_done
    }

    pub fn is_phase_done(&self, phase: Phase) -> bool {
        match phase {
            Phase::Tables => self.tables_done,
            Phase::Indexes => self.indexes_done,
            Phase::Sequences => self.sequences_done,
            Phase::Vacuum => self.vacuum_done,
        }
    }
}

/// Prepares the run directory for `mode` and returns the state the run starts from.
pub async fn prepare_run_dir(paths: &RunPaths, mode: RunMode) -> CopyDbResult<RunState> {
    let state = RunState::inspect(paths).await?;

    match mode {
        RunMode::Fresh if state.has_previous_run() => {
            bail!(
                ErrorKind::InvalidState,
                "Run directory holds a previous run, use resume or restart",
                format!("topdir: {}", paths.topdir.display())
            );
        }
        RunMode::Restart if state.has_previous_run() => {
            info!(topdir = %paths.topdir.display(), "restarting, removing previous run state");
            paths.clean(false).await?;
            paths.create_dirs().await?;

            return Ok(RunState::default());
        }
        RunMode::Resume => {
            info!(
                topdir = %paths.topdir.display(),
                tables_done = state.tables_done,
                indexes_done = state.indexes_done,
                "resuming previous run"
            );
        }
        _ => {}
    }

    paths.create_dirs().await?;

    Ok(state)
}
