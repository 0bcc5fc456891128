//! Coordination of the work units of a run: claims, completion gates, run directory state.

pub mod claim;
pub mod liveness;
pub mod markers;
pub mod paths;
pub mod reconcile;
pub mod state;
pub mod unit;

pub use claim::{ClaimOutcome, Coordinator, UnitClaim};
pub use liveness::{ClaimTicket, LiveClaims, Liveness, ProcessLiveness};
pub use paths::{CdcPaths, Phase, RunPaths};
pub use reconcile::{TableFollowUp, constraint_units, index_units};
pub use state::{PidFile, RunMode, RunState, prepare_run_dir};
pub use unit::WorkUnit;
