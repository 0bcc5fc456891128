use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::error::{CopyDbResult, ErrorKind};
use crate::replay::Applier;
use crate::types::PgLsn;

/// Distance between the target positions of two consecutive commits.
const COMMIT_LSN_STEP: u64 = 0x10;

#[derive(Debug, Default)]
struct Inner {
    open: Option<(u32, Vec<String>)>,
    committed: Vec<(u32, Vec<String>)>,
    insert_lsn: u64,
}

/// An [`Applier`] recording replayed transactions in memory.
///
/// Clones share the same journal. Every commit advances the target position, which is
/// reported as flushed right away.
#[derive(Debug, Clone, Default)]
pub struct MemoryApplier {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transaction ids in commit order.
    pub async fn committed_xids(&self) -> Vec<u32> {
        let inner = self.inner.lock().await;
        inner.committed.iter().map(|(xid, _)| *xid).collect()
    }

    /// Statements of every committed transaction, in commit order.
    pub async fn committed_statements(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .committed
            .iter()
            .flat_map(|(_, statements)| statements.iter().cloned())
            .collect()
    }

    pub async fn has_open_transaction(&self) -> bool {
        self.inner.lock().await.open.is_some()
    }
}

impl Applier for MemoryApplier {
    async fn begin(&mut self, xid: u32) -> CopyDbResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some((open, _)) = &inner.open {
            bail!(
                ErrorKind::InvalidState,
                "A transaction is already open on the target",
                format!("open xid: {open}, new xid: {xid}")
            );
        }
        inner.open = Some((xid, Vec::new()));

        Ok(())
    }

    async fn apply(&mut self, sql: &str) -> CopyDbResult<()> {
        let mut inner = self.inner.lock().await;
        let Some((_, statements)) = inner.open.as_mut() else {
            bail!(ErrorKind::InvalidState, "No transaction is open on the target");
        };
        statements.push(sql.to_owned());

        Ok(())
    }

    async fn commit(&mut self) -> CopyDbResult<PgLsn> {
        let mut inner = self.inner.lock().await;
        let Some(transaction) = inner.open.take() else {
            bail!(ErrorKind::InvalidState, "No transaction is open on the target");
        };
        inner.committed.push(transaction);
        inner.insert_lsn += COMMIT_LSN_STEP;

        Ok(PgLsn::from(inner.insert_lsn))
    }

    async fn flush_lsn(&mut self) -> CopyDbResult<PgLsn> {
        Ok(PgLsn::from(self.inner.lock().await.insert_lsn))
    }
}
