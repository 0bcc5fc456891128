use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_dir() -> PathBuf {
    std::env::temp_dir().join("copydb")
}

/// Where a run keeps its catalogs, markers and logs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    /// Top-level work directory.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// When set, logs are also written to daily rolling files in this directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            log_dir: None,
        }
    }
}
