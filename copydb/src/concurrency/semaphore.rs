//! Per-catalog mutex.
//!
//! Each catalog owns one [`CatalogSemaphore`] with a single permit. Clones share the permit, so
//! every worker of a run serializes its racy catalog operations on the same semaphore without
//! any process-wide registry. The permit is released when the returned guard is dropped, on
//! every exit path.
//!
//! The semaphore is not reentrant: code holding a [`CatalogPermit`] must call the transactional
//! variants of catalog operations, which never acquire it again.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::bail;
use crate::error::{CopyDbResult, ErrorKind};

#[derive(Debug, Clone)]
pub struct CatalogSemaphore {
    inner: Arc<Semaphore>,
}

/// Proof that the catalog semaphore is held.
#[derive(Debug)]
pub struct CatalogPermit {
    _permit: OwnedSemaphorePermit,
}

impl CatalogSemaphore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(1)),
        }
    }

    /// Waits until the semaphore is available.
    pub async fn lock(&self) -> CopyDbResult<CatalogPermit> {
        match self.inner.clone().acquire_owned().await {
            Ok(permit) => Ok(CatalogPermit { _permit: permit }),
            Err(_) => bail!(ErrorKind::InvalidState, "Catalog semaphore was closed"),
        }
    }

    /// Whether another holder currently owns the permit.
    pub fn is_locked(&self) -> bool {
        self.inner.available_permits() == 0
    }
}

impl Default for CatalogSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn clones_share_the_permit() {
        let semaphore = CatalogSemaphore::new();
        let clone = semaphore.clone();

        let permit = semaphore.lock().await.unwrap();
        assert!(clone.is_locked());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), clone.lock())
                .await
                .is_err()
        );

        drop(permit);
        assert!(!clone.is_locked());
        let _permit = clone.lock().await.unwrap();
    }
}
