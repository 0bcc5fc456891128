//! Catalog stores and their typed access layer.
//!
//! A run keeps three catalogs: `source` holds the retained objects and the coordination state,
//! `filter` the excluded objects and the exclusion index, and `target` what already exists on
//! the target server.

mod ddl;
pub mod filter;
pub mod index;
pub mod lsn_tracking;
pub mod objects;
pub mod process;
pub mod retry;
pub mod section;
pub mod sentinel;
pub mod sequence;
pub mod setup;
pub mod sql;
pub mod store;
pub mod summary;
pub mod table;
pub mod timeline;
pub mod timing;

pub use filter::{FilterEntry, FilterKind, FilterOptions};
pub use index::{SourceConstraint, SourceIndex};
pub use lsn_tracking::{LsnTrackingPoint, durable_lsn};
pub use objects::{
    Collation, DatabaseProperty, Depend, Extension, ExtensionConfig, Matview, Namespace, Role,
    SourceDatabase,
};
pub use process::ProcessInfo;
pub use section::{Section, SectionState};
pub use sentinel::{Sentinel, SentinelState};
pub use sequence::SourceSequence;
pub use setup::{SetupCheck, SetupRecord};
pub use store::{AttachedCatalog, Catalog, CatalogRole, CatalogTransaction, Catalogs};
pub use summary::{CompletionGate, SummaryCounts, SummaryRecord};
pub use table::{SourceTable, TableAttribute, TableChecksum, TableChecksums, TablePart, split_parts};
pub use timeline::{TimelineHistoryEntry, parse_timeline_history};
pub use timing::{TimingRecord, VacuumRecord};
