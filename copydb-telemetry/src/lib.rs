//! Telemetry setup shared by the copydb binary and tests.

pub mod tracing;
