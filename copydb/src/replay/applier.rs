use std::future::Future;

use crate::error::CopyDbResult;
use crate::types::PgLsn;

/// Applies replayed transactions to the target.
pub trait Applier: Send {
    fn begin(&mut self, xid: u32) -> impl Future<Output = CopyDbResult<()>> + Send;

    fn apply(&mut self, sql: &str) -> impl Future<Output = CopyDbResult<()>> + Send;

    /// Commits the open transaction and returns the target position it was written at.
    fn commit(&mut self) -> impl Future<Output = CopyDbResult<PgLsn>> + Send;

    /// Target position known to be flushed to disk.
    fn flush_lsn(&mut self) -> impl Future<Output = CopyDbResult<PgLsn>> + Send;
}
