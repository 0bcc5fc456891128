use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

const fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_plugin() -> String {
    "test_decoding".to_string()
}

fn default_slot_name() -> String {
    "copydb".to_string()
}

/// Settings of the logical replication catch-up and replay phase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Logical decoding output plugin.
    #[serde(default = "default_plugin")]
    pub plugin: String,
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    /// Position at which replay stops, in `X/X` form.
    #[serde(default)]
    pub endpos: Option<String>,
    /// Continuous replay mode: changes are applied without waiting for the sentinel `apply`
    /// flag.
    #[serde(default)]
    pub replay: bool,
    /// How often the applier re-reads the sentinel while waiting.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.slot_name.is_empty() {
            return Err(ValidationError::EmptySlotName);
        }

        if let Some(endpos) = &self.endpos {
            if !is_lsn(endpos) {
                return Err(ValidationError::InvalidLsn(endpos.clone()));
            }
        }

        Ok(())
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            slot_name: default_slot_name(),
            endpos: None,
            replay: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn is_lsn(value: &str) -> bool {
    value.split_once('/').is_some_and(|(high, low)| {
        !high.is_empty()
            && !low.is_empty()
            && u32::from_str_radix(high, 16).is_ok()
            && u32::from_str_radix(low, 16).is_ok()
    })
}
