use copydb_config::shared::CopyDbConfig;
use copydb_config::{load_config, load_config_from};

use crate::args::RunArgs;
use crate::error::{CliError, CliResult};

/// Loads the configuration, applies the command line overrides and validates the result.
pub fn load_copydb_config(args: &RunArgs) -> CliResult<CopyDbConfig> {
    let mut config = match &args.config_dir {
        Some(dir) => load_config_from::<CopyDbConfig>(dir),
        None => load_config::<CopyDbConfig>(),
    }
    .map_err(CliError::config)?;

    args.apply(&mut config);
    config.validate().map_err(CliError::config)?;

    Ok(config)
}
