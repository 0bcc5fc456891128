//! Shared configuration types for copydb runs.

mod base;
mod connection;
mod copy;
mod copydb;
mod filters;
mod replay;
mod run;

pub use base::ValidationError;
pub use connection::ConnectionConfig;
pub use copy::{CopyConfig, DEFAULT_QUEUE_CAPACITY};
pub use copydb::CopyDbConfig;
pub use filters::{FilterConfig, FilterType, QualifiedName};
pub use replay::ReplayConfig;
pub use run::RunConfig;
