//! Catalog and work coordination engine of a Postgres database copy.
//!
//! A run fetches the source schema into embedded catalogs, then table copy, index, vacuum and
//! sequence workers process it, coordinating through claim and done markers in a run
//! directory so that any interrupted run can be resumed. The replay controller applies the
//! change stream that catches the target up with the source.

pub mod catalog;
pub mod clients;
pub mod concurrency;
pub mod context;
pub mod coordination;
pub mod error;
pub mod failpoints;
pub mod filter;
mod macros;
pub mod pipeline;
pub mod progress;
pub mod replay;
pub mod schema;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
