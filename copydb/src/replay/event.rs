use std::fmt;

use crate::types::PgLsn;

/// A decoded change stream message, as far as the applier is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    /// Opens transaction `xid`, whose commit is at `lsn`.
    Begin { xid: u32, lsn: PgLsn },
    /// One SQL statement of the open transaction.
    Statement { lsn: PgLsn, sql: String },
    Commit { lsn: PgLsn },
    /// The source has nothing to send up to `lsn`.
    Keepalive { lsn: PgLsn },
    /// The receiver moved on to the next WAL file.
    SwitchWal { lsn: PgLsn },
    /// A new end position was requested.
    Endpos { lsn: PgLsn },
}

impl ReplayEvent {
    pub fn lsn(&self) -> PgLsn {
        match self {
            ReplayEvent::Begin { lsn, .. }
            | ReplayEvent::Statement { lsn, .. }
            | ReplayEvent::Commit { lsn }
            | ReplayEvent::Keepalive { lsn }
            | ReplayEvent::SwitchWal { lsn }
            | ReplayEvent::Endpos { lsn } => *lsn,
        }
    }
}

impl fmt::Display for ReplayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayEvent::Begin { xid, lsn } => write!(f, "BEGIN {xid} at {lsn}"),
            ReplayEvent::Statement { lsn, .. } => write!(f, "STATEMENT at {lsn}"),
            ReplayEvent::Commit { lsn } => write!(f, "COMMIT at {lsn}"),
            ReplayEvent::Keepalive { lsn } => write!(f, "KEEPALIVE at {lsn}"),
            ReplayEvent::SwitchWal { lsn } => write!(f, "SWITCH WAL at {lsn}"),
            ReplayEvent::Endpos { lsn } => write!(f, "ENDPOS {lsn}"),
        }
    }
}
