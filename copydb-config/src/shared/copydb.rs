use serde::Deserialize;

use crate::Config;
use crate::shared::{
    ConnectionConfig, CopyConfig, FilterConfig, ReplayConfig, RunConfig, ValidationError,
};

/// Top-level configuration of a copydb run.
///
/// This intentionally does not implement `Serialize` to avoid leaking the connection URIs.
#[derive(Clone, Debug, Deserialize)]
pub struct CopyDbConfig {
    pub source: ConnectionConfig,
    #[serde(default)]
    pub target: Option<ConnectionConfig>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

impl CopyDbConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.copy.validate()?;
        self.filters.validate()?;
        self.replay.validate()?;

        Ok(())
    }
}

impl Config for CopyDbConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[
        "filters.include_only_schema",
        "filters.exclude_schema",
        "filters.include_only_table",
        "filters.exclude_table",
        "filters.exclude_table_data",
        "filters.exclude_index",
    ];
}
