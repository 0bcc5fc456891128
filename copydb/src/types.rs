//! Identifier and position types shared across the crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
pub use tokio_postgres::types::PgLsn;
use uuid::Uuid;

use crate::bail;
use crate::error::{CopyDbResult, ErrorKind};

/// Numeric object identifier of a relation, index, constraint or sequence on the source.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Oid(pub u32);

impl Oid {
    /// The zero oid, used by archive entries that carry no object.
    pub const INVALID: Oid = Oid(0);

    pub fn new(oid: u32) -> Self {
        Self(oid)
    }

    pub fn into_inner(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl From<u32> for Oid {
    fn from(oid: u32) -> Self {
        Self(oid)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Oid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(Oid)
    }
}

/// Identity of a worker holding a claim on a unit of work.
///
/// Workers are tasks, so the process id alone does not tell two claims of the same run apart;
/// every claim carries a fresh token as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claimant {
    pub pid: u32,
    pub token: Uuid,
}

impl Claimant {
    /// A new claimant of the current process.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            token: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for Claimant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.token)
    }
}

/// The invalid position `0/0`.
pub fn invalid_lsn() -> PgLsn {
    PgLsn::from(0u64)
}

/// Parses a `X/X` position.
pub fn parse_lsn(value: &str) -> CopyDbResult<PgLsn> {
    match value.parse::<PgLsn>() {
        Ok(lsn) => Ok(lsn),
        Err(_) => bail!(
            ErrorKind::InvalidLsn,
            "Invalid LSN",
            format!("value: {value:?}")
        ),
    }
}

/// Parses an optional stored position, mapping `NULL` to [`invalid_lsn`].
pub fn parse_stored_lsn(value: Option<&str>) -> CopyDbResult<PgLsn> {
    match value {
        Some(value) => parse_lsn(value),
        None => Ok(invalid_lsn()),
    }
}

pub fn is_valid_lsn(lsn: PgLsn) -> bool {
    lsn != invalid_lsn()
}
