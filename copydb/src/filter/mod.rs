//! Exclusion of filtered-out objects: preparation of the filter catalog and archive lists.

pub mod resolver;
pub mod toc;

pub use resolver::{lookup_exclusion, resolve_filters};
pub use toc::{TocDecision, TocEntry, TocFilter, TocSummary, parse_toc, write_filtered_toc};
