use std::error::Error as StdError;
use std::process::ExitCode;

use copydb::error::{CopyDbError, ErrorKind};
use thiserror::Error;

/// Result type for command line operations.
pub type CliResult<T> = Result<T, CliError>;

const EXIT_CODE_BAD_CONFIG: u8 = 2;
const EXIT_CODE_BAD_STATE: u8 = 3;
const EXIT_CODE_SOURCE: u8 = 6;
const EXIT_CODE_TARGET: u8 = 7;
const EXIT_CODE_INTERNAL_ERROR: u8 = 12;

/// Error type of the copydb binary.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    CopyDb(#[from] CopyDbError),

    #[error("configuration error: {0}")]
    Config(#[source] Box<dyn StdError + Send + Sync>),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    pub fn config<E: StdError + Send + Sync + 'static>(err: E) -> Self {
        CliError::Config(Box::new(err))
    }

    pub fn category(&self) -> &'static str {
        match self {
            CliError::CopyDb(_) => "copy error",
            CliError::Config(_) => "configuration error",
            CliError::Io(_) => "i/o error",
            CliError::Output(_) => "output error",
        }
    }

    /// Process exit status, distinguishing configuration, state, source and target failures.
    pub fn exit_status(&self) -> u8 {
        match self {
            CliError::CopyDb(err) => exit_status_of(err.kind()),
            CliError::Config(_) => EXIT_CODE_BAD_CONFIG,
            CliError::Io(_) | CliError::Output(_) => EXIT_CODE_INTERNAL_ERROR,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    /// Returns a user-oriented report for terminal output.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("copydb failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        // Copy errors already render their detail and aggregated errors.
        if !matches!(self, CliError::CopyDb(_)) {
            let mut source = StdError::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                out.push_str(&format!("cause {idx}: {err}\n"));
                source = err.source();
                idx += 1;
            }
        }

        out
    }
}

fn exit_status_of(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::ConfigError | ErrorKind::ConfigMismatch => EXIT_CODE_BAD_CONFIG,
        ErrorKind::DuplicateRun
        | ErrorKind::InvalidMarker
        | ErrorKind::InvalidState
        | ErrorKind::CatalogNotFound => EXIT_CODE_BAD_STATE,
        ErrorKind::SourceConnectionFailed | ErrorKind::SourceQueryFailed => EXIT_CODE_SOURCE,
        ErrorKind::TargetConnectionFailed | ErrorKind::TargetQueryFailed => EXIT_CODE_TARGET,
        _ => EXIT_CODE_INTERNAL_ERROR,
    }
}
