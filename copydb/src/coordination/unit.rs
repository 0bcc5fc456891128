use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Oid;

/// A unit of work tracked by the claim protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    /// COPY of a table, or of one part of a split table. Part 0 is the whole table.
    TablePart { table_oid: Oid, partnum: u32 },
    Index { table_oid: Oid, index_oid: Oid },
    Constraint { table_oid: Oid, constraint_oid: Oid },
}

impl WorkUnit {
    pub fn whole_table(table_oid: Oid) -> Self {
        WorkUnit::TablePart {
            table_oid,
            partnum: 0,
        }
    }

    /// Copy units of a table split in `partcount` parts, or of the whole table.
    pub fn table_parts(table_oid: Oid, partcount: u32) -> Vec<WorkUnit> {
        if partcount == 0 {
            return vec![WorkUnit::whole_table(table_oid)];
        }

        (1..=partcount)
            .map(|partnum| WorkUnit::TablePart { table_oid, partnum })
            .collect()
    }

    pub fn table_oid(&self) -> Oid {
        match *self {
            WorkUnit::TablePart { table_oid, .. }
            | WorkUnit::Index { table_oid, .. }
            | WorkUnit::Constraint { table_oid, .. } => table_oid,
        }
    }

    /// Oid of the object the unit builds or copies.
    pub fn object_oid(&self) -> Oid {
        match *self {
            WorkUnit::TablePart { table_oid, .. } => table_oid,
            WorkUnit::Index { index_oid, .. } => index_oid,
            WorkUnit::Constraint { constraint_oid, .. } => constraint_oid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkUnit::TablePart { .. } => "table",
            WorkUnit::Index { .. } => "index",
            WorkUnit::Constraint { .. } => "constraint",
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            WorkUnit::TablePart {
                table_oid,
                partnum: 0,
            } => write!(f, "table {table_oid}"),
            WorkUnit::TablePart { table_oid, partnum } => {
                write!(f, "table {table_oid} part {partnum}")
            }
            WorkUnit::Index { index_oid, .. } => write!(f, "index {index_oid}"),
            WorkUnit::Constraint { constraint_oid, .. } => {
                write!(f, "constraint {constraint_oid}")
            }
        }
    }
}
