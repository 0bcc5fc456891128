use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` cannot be zero")]
    JobsZero(&'static str),
    #[error("`queue_capacity` cannot be zero")]
    QueueCapacityZero,
    #[error("`split_max_parts` must be at least 2 when `split_tables_larger_than` is set")]
    SplitMaxPartsTooSmall,
    #[error("`snapshot` is only valid when `consistent` is enabled")]
    SnapshotWithoutConsistent,
    #[error("`resume` and `restart` cannot be both enabled")]
    ResumeAndRestart,
    #[error("filters cannot combine `{0}` with `{1}`")]
    ConflictingFilters(&'static str, &'static str),
    #[error("invalid qualified name `{0}`, expected `schema.name`")]
    InvalidQualifiedName(String),
    #[error("invalid LSN `{0}`, expected the `X/X` hexadecimal form")]
    InvalidLsn(String),
    #[error("`slot_name` cannot be empty")]
    EmptySlotName,
}
