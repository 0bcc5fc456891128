//! The source schema: in-memory indexes over its objects and the population of the catalogs.

pub mod arena;
pub mod fetch;

pub use arena::{Handle, SchemaArena, SchemaEntity};
pub use fetch::{ClassifiedSchema, SchemaStats, SplitSettings, classify_schema, fetch_schema};
