//! Configuration for copydb runs.
//!
//! Holds the typed configuration shared by the library and the binary, together with the
//! layered loader that merges configuration files and `APP_` environment overrides.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
