//! Liveness of claimants.
//!
//! A claim left behind by a claimant that is no longer alive is stale and may be taken over.
//! Claimants of other processes are probed with signal 0. Claimants of the current process are
//! worker tasks: they are alive exactly as long as the [`ClaimTicket`] they received with the
//! claim is held.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::types::Claimant;

/// Decides whether the claimant of a claim is still working on it.
pub trait Liveness: Debug + Send + Sync {
    fn is_alive(&self, claimant: &Claimant) -> bool;
}

/// Registry of the claim tokens held by the tasks of this process.
#[derive(Debug, Clone, Default)]
pub struct LiveClaims {
    tokens: Arc<Mutex<HashSet<Uuid>>>,
}

impl LiveClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `claimant` until the returned ticket is dropped.
    pub fn register(&self, claimant: Claimant) -> ClaimTicket {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(claimant.token);

        ClaimTicket {
            claimant,
            claims: self.clone(),
        }
    }

    pub fn contains(&self, token: &Uuid) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, token: &Uuid) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token);
    }
}

/// Proof that a task of this process holds a claim.
#[derive(Debug)]
pub struct ClaimTicket {
    claimant: Claimant,
    claims: LiveClaims,
}

impl ClaimTicket {
    pub fn claimant(&self) -> &Claimant {
        &self.claimant
    }
}

impl Drop for ClaimTicket {
    fn drop(&mut self) {
        self.claims.release(&self.claimant.token);
    }
}

/// Liveness as seen from process `pid`.
#[derive(Debug, Clone)]
pub struct ProcessLiveness {
    pid: u32,
    claims: LiveClaims,
}

impl ProcessLiveness {
    pub fn new(pid: u32, claims: LiveClaims) -> Self {
        Self { pid, claims }
    }

    /// Liveness of the current process.
    pub fn current(claims: LiveClaims) -> Self {
        Self::new(std::process::id(), claims)
    }
}

impl Liveness for ProcessLiveness {
    fn is_alive(&self, claimant: &Claimant) -> bool {
        if claimant.pid == self.pid {
            self.claims.contains(&claimant.token)
        } else {
            pid_is_alive(claimant.pid)
        }
    }
}

/// Whether a process with `pid` exists.
///
/// A process owned by another user still counts as alive.
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
