use std::fmt;

/// Classification of the workers of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerType {
    /// Copies the rows of tables and table parts.
    TableCopy,
    /// Builds indexes, then the constraints of tables whose indexes are all built.
    Index,
    /// Runs `VACUUM ANALYZE` on copied tables.
    Vacuum,
    /// Computes source and target checksums.
    Compare,
    /// Resets target sequences to their source values.
    Sequences,
}

impl WorkerType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerType::TableCopy => "copy",
            WorkerType::Index => "index",
            WorkerType::Vacuum => "vacuum",
            WorkerType::Compare => "compare",
            WorkerType::Sequences => "sequences",
        }
    }

    /// Name of worker `id`, as recorded in the process table.
    pub fn worker_name(self, id: usize) -> String {
        format!("{}-{id}", self.as_str())
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
