//! Population of the source and filter catalogs from the source server.
//!
//! The source schema is fetched once, split into the objects the user's filters retain and the
//! ones they exclude, and stored: retained objects in the source catalog, excluded objects in
//! the filter catalog, from which the exclusion index is later prepared.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use copydb_config::shared::FilterConfig;
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{
    Catalog, Catalogs, FilterOptions, Section, SourceSequence, SourceTable, split_parts,
};
use crate::clients::{SourceClient, SourceSchema};
use crate::error::CopyDbResult;
use crate::schema::arena::SchemaArena;
use crate::types::Oid;

/// Size threshold and part bound of table splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSettings {
    pub threshold: u64,
    /// Zero leaves the part count unbounded.
    pub max_parts: u32,
}

impl SplitSettings {
    pub fn from_options(threshold: Option<u64>, max_parts: Option<u32>) -> Option<Self> {
        threshold.filter(|&t| t > 0).map(|threshold| Self {
            threshold,
            max_parts: max_parts.unwrap_or(0),
        })
    }
}

/// A fetched schema split by the filters.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedSchema {
    pub retained: SourceSchema,
    pub excluded: SourceSchema,
}

/// What [`fetch_schema`] stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchemaStats {
    pub tables: usize,
    pub table_parts: usize,
    pub indexes: usize,
    pub sequences: usize,
    pub excluded_tables: usize,
    pub excluded_indexes: usize,
    pub excluded_sequences: usize,
    pub depends: usize,
}

/// Splits `schema` into retained and excluded objects.
///
/// Sequences follow their tables: a sequence owned by, or used in a default of, a retained
/// table is retained, and a standalone sequence is filtered by its own name. Excluded
/// relationships of a retained sequence are kept on the excluded side so that the filter
/// comments out their `OWNED BY` and `DEFAULT` entries.
pub fn classify_schema(
    schema: SourceSchema,
    filters: &FilterConfig,
    options: FilterOptions,
) -> ClassifiedSchema {
    let mut classified = ClassifiedSchema::default();

    for namespace in schema.namespaces {
        if filters.retains_schema(&namespace.nspname) {
            classified.retained.namespaces.push(namespace);
        } else {
            classified.excluded.namespaces.push(namespace);
        }
    }

    if options.skip_extensions {
        classified.excluded.extensions = schema.extensions.clone();
    }
    classified.retained.extensions = schema.extensions;

    if options.skip_collations {
        classified.excluded.collations = schema.collations.clone();
    }
    classified.retained.collations = schema.collations;

    let mut tables = SchemaArena::new();
    for mut table in schema.tables {
        if filters.retains_table(&table.nspname, &table.relname) {
            table.exclude_data = filters.excludes_data(&table.nspname, &table.relname);
            tables.insert(table);
        } else {
            classified.excluded.tables.push(table);
        }
    }

    for index in schema.indexes {
        if tables.contains_oid(index.table_oid)
            && !filters.excludes_index(&index.nspname, &index.relname)
        {
            classified.retained.indexes.push(index);
        } else {
            classified.excluded.indexes.push(index);
        }
    }

    let mut sequences: BTreeMap<Oid, Vec<SourceSequence>> = BTreeMap::new();
    for sequence in schema.sequences {
        sequences.entry(sequence.oid).or_default().push(sequence);
    }

    for rows in sequences.into_values() {
        let retained = retains_sequence(&rows, filters, &tables);

        for row in rows {
            let mut excluded = row.clone();
            if tables.contains_oid(excluded.ownedby) {
                excluded.ownedby = Oid::INVALID;
            }
            if tables.contains_oid(excluded.attrelid) {
                excluded.attrelid = Oid::INVALID;
                excluded.attroid = Oid::INVALID;
            }

            if !retained || excluded.ownedby.is_valid() || excluded.attroid.is_valid() {
                classified.excluded.sequences.push(excluded);
            }
            if retained {
                classified.retained.sequences.push(row);
            }
        }
    }

    classified.retained.tables = tables.iter().cloned().collect();

    classified
}

fn retains_sequence(
    rows: &[SourceSequence],
    filters: &FilterConfig,
    tables: &SchemaArena<SourceTable>,
) -> bool {
    let Some(first) = rows.first() else {
        return false;
    };

    if !filters.retains_schema(&first.nspname) {
        return false;
    }

    let standalone = rows
        .iter()
        .all(|row| !row.ownedby.is_valid() && !row.attrelid.is_valid());
    if standalone {
        return filters.retains_table(&first.nspname, &first.relname);
    }

    rows.iter()
        .any(|row| tables.contains_oid(row.ownedby) || tables.contains_oid(row.attrelid))
}

/// Fetches the source schema and stores it in the source and filter catalogs.
///
/// Returns `None` without querying the source when the schema was already fetched by a
/// previous run over the same catalogs.
pub async fn fetch_schema<S: SourceClient>(
    catalogs: &Catalogs,
    source: &mut S,
    filters: &FilterConfig,
    options: FilterOptions,
    split: Option<SplitSettings>,
    schema_file: &Path,
) -> CopyDbResult<Option<SchemaStats>> {
    if catalogs.source.section(Section::Schema).await?.fetched {
        info!("source schema already fetched, reusing the catalogs");
        return Ok(None);
    }

    let start = Utc::now();
    let schema = source.fetch_schema().await?;
    let mut classified = classify_schema(schema, filters, options);

    if let Some(split) = split {
        for table in &mut classified.retained.tables {
            split_table(source, table, split).await?;
        }
    }

    let excluded_tables: Vec<Oid> = classified
        .excluded
        .tables
        .iter()
        .map(|table| table.oid)
        .collect();
    let depends = source.fetch_depends(&excluded_tables).await?;

    store_schema(&catalogs.source, &classified.retained).await?;
    store_schema(&catalogs.filter, &classified.excluded).await?;
    for depend in &depends {
        catalogs.filter.add_depend(depend).await?;
    }

    let done = Utc::now();
    for section in [
        Section::Namespaces,
        Section::Extensions,
        Section::Collations,
        Section::Schema,
    ] {
        catalogs.source.mark_section_fetched(section, start, done).await?;
        catalogs.filter.mark_section_fetched(section, start, done).await?;
    }
    catalogs
        .filter
        .mark_section_fetched(Section::Depends, start, done)
        .await?;
    if split.is_some() {
        catalogs
            .source
            .mark_section_fetched(Section::TableDataParts, start, done)
            .await?;
    }

    let schema_json = serde_json::to_vec_pretty(&classified.retained)?;
    tokio::fs::write(schema_file, schema_json).await?;

    let stats = SchemaStats {
        tables: classified.retained.tables.len(),
        table_parts: classified
            .retained
            .tables
            .iter()
            .map(|table| table.parts.len())
            .sum(),
        indexes: classified.retained.indexes.len(),
        sequences: classified.retained.sequences.len(),
        excluded_tables: classified.excluded.tables.len(),
        excluded_indexes: classified.excluded.indexes.len(),
        excluded_sequences: classified.excluded.sequences.len(),
        depends: depends.len(),
    };

    info!(
        tables = stats.tables,
        table_parts = stats.table_parts,
        indexes = stats.indexes,
        sequences = stats.sequences,
        excluded_tables = stats.excluded_tables,
        "fetched source schema"
    );

    Ok(Some(stats))
}

async fn split_table<S: SourceClient>(
    source: &mut S,
    table: &mut SourceTable,
    split: SplitSettings,
) -> CopyDbResult<()> {
    if table.exclude_data || table.bytes < split.threshold {
        return Ok(());
    }

    let Some(part_key) = table.part_key.as_deref() else {
        debug!(qname = %table.qname, "table has no integer key to split on");
        return Ok(());
    };

    let Some((min, max)) = source.key_range(&table.qname, part_key).await? else {
        return Ok(());
    };

    table.parts = split_parts(
        table.bytes,
        split.threshold,
        split.max_parts,
        min,
        max,
        table.reltuples,
    );
    table.partcount = table.parts.len() as u32;

    if !table.parts.is_empty() {
        info!(qname = %table.qname, parts = table.partcount, %part_key, "splitting table");
    }

    Ok(())
}

async fn store_schema(catalog: &Catalog, schema: &SourceSchema) -> CopyDbResult<()> {
    for namespace in &schema.namespaces {
        catalog.add_namespace(namespace).await?;
    }
    for extension in &schema.extensions {
        catalog.add_extension(extension).await?;
    }
    for collation in &schema.collations {
        catalog.add_collation(collation).await?;
    }
    for table in &schema.tables {
        catalog.add_table(table).await?;
    }
    for index in &schema.indexes {
        catalog.add_index(index).await?;
    }
    for sequence in &schema.sequences {
        catalog.add_sequence(sequence).await?;
    }

    Ok(())
}
