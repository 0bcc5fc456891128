use fail::fail_point;

use crate::bail;
use crate::error::{CopyDbResult, ErrorKind};

/// Between creating the claim marker of a unit and recording its summary row.
pub const CLAIM_AFTER_MARKER: &str = "claim.after_marker";
/// Between writing the done marker of a unit and finishing its summary row.
pub const FINISH_BEFORE_SUMMARY: &str = "finish.before_summary";
/// Between electing the parts-done winner of a table and enqueueing its indexes.
pub const PARTS_DONE_BEFORE_ENQUEUE: &str = "parts_done.before_enqueue";
/// Inside the COPY of a table part, before any row reaches the target.
pub const TABLE_COPY_BEFORE_COPY: &str = "table_copy.before_copy";

/// Returns an injected error when the failpoint `name` is configured to fire.
pub fn copydb_fail_point(name: &str) -> CopyDbResult<()> {
    fail_point!(name, |_| {
        bail!(
            ErrorKind::InjectedFailure,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
