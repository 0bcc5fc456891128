//! Testing utilities for copies and replays that run without a Postgres server.
//!
//! The [`memory`] module provides a [`Connector`](crate::clients::Connector) whose source and
//! target live in memory, with a journal of every statement and injectable failures. The
//! [`run`] module sets up a run directory with initialized catalogs in a temporary directory
//! and builds contexts over it.
//!
//! - [`applier`] - in-memory replay applier
//! - [`memory`] - in-memory source and target servers
//! - [`notify`] - timed notifications for waiting on asynchronous state
//! - [`run`] - run directories, catalogs and schema fixtures
//! - [`failpoints`] - scoped failpoint configuration
pub mod applier;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod memory;
pub mod notify;
pub mod run;
