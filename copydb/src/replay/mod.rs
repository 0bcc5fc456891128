//! Catch-up and replay of the change stream, controlled through the sentinel.

pub mod applier;
pub mod controller;
pub mod event;
pub mod sql_file;
pub mod timeline;

pub use applier::Applier;
pub use controller::{ReplayController, ReplayLoopResult, ReplayOptions, ReplayOutcome};
pub use event::ReplayEvent;
pub use sql_file::{SqlChangeParser, read_sql_changes};
pub use timeline::load_timeline_history;
