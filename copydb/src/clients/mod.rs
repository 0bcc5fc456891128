//! Clients of the source and target servers.

pub mod base;
pub mod postgres;

pub use base::{Connector, CopySpec, SourceClient, SourceSchema, TargetClient};
pub use postgres::{PostgresConnector, PostgresSource, PostgresTarget, target_error};
