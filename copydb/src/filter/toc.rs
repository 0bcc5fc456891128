//! Archive table-of-contents lists, as printed by `pg_restore --list`.
//!
//! Every entry reads `dumpId; catalogOid objectOid DESCRIPTION tag`. The filtered list keeps
//! every entry and comments out the excluded ones with a leading `;`, which `pg_restore
//! --use-list` skips.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::{Catalog, FilterKind};
use crate::coordination::{Coordinator, WorkUnit};
use crate::copydb_error;
use crate::error::{CopyDbResult, ErrorKind};
use crate::filter::resolver::lookup_exclusion;
use crate::types::Oid;

/// Descriptions `pg_restore` prints, several of which span more than one word.
const DESCRIPTIONS: &[&str] = &[
    "ACCESS METHOD",
    "ACL",
    "AGGREGATE",
    "ATTRDEF",
    "BLOB DATA",
    "BLOB",
    "CAST",
    "CHECK CONSTRAINT",
    "COLLATION",
    "COMMENT",
    "CONSTRAINT",
    "CONVERSION",
    "DATABASE",
    "DEFAULT ACL",
    "DEFAULT",
    "DOMAIN",
    "DUMMY TYPE",
    "EVENT TRIGGER",
    "EXTENSION",
    "FK CONSTRAINT",
    "FOREIGN DATA WRAPPER",
    "FOREIGN SERVER",
    "FOREIGN TABLE",
    "FUNCTION",
    "INDEX ATTACH",
    "INDEX",
    "LANGUAGE",
    "LARGE OBJECT",
    "MATERIALIZED VIEW DATA",
    "MATERIALIZED VIEW",
    "OPERATOR CLASS",
    "OPERATOR FAMILY",
    "OPERATOR",
    "POLICY",
    "PROCEDURAL LANGUAGE",
    "PROCEDURE",
    "PUBLICATION TABLES IN SCHEMA",
    "PUBLICATION TABLE",
    "PUBLICATION",
    "ROW SECURITY",
    "RULE",
    "SCHEMA",
    "SEQUENCE OWNED BY",
    "SEQUENCE SET",
    "SEQUENCE",
    "SERVER",
    "SHELL TYPE",
    "STATISTICS",
    "SUBSCRIPTION",
    "TABLE ATTACH",
    "TABLE DATA",
    "TABLE",
    "TEXT SEARCH CONFIGURATION",
    "TEXT SEARCH DICTIONARY",
    "TEXT SEARCH PARSER",
    "TEXT SEARCH TEMPLATE",
    "TRANSFORM",
    "TRIGGER",
    "TYPE",
    "USER MAPPING",
    "VIEW",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub dump_id: u32,
    pub catalog_oid: Oid,
    pub object_oid: Oid,
    pub desc: &'static str,
    /// Remainder of the line after the description.
    pub tag: String,
    /// Name under which the filter catalog can register the object, if any.
    pub restore_list_name: Option<String>,
}

impl TocEntry {
    pub fn parse(line: &str) -> CopyDbResult<Self> {
        let malformed = || {
            copydb_error!(
                ErrorKind::InvalidData,
                "Malformed archive list entry",
                format!("line: {line:?}")
            )
        };

        let (dump_id, rest) = line.split_once("; ").ok_or_else(malformed)?;
        let dump_id = dump_id.trim().parse::<u32>().map_err(|_| malformed())?;

        let (catalog_oid, rest) = rest.split_once(' ').ok_or_else(malformed)?;
        let catalog_oid = catalog_oid.parse::<Oid>().map_err(|_| malformed())?;

        let (object_oid, rest) = rest.split_once(' ').ok_or_else(malformed)?;
        let object_oid = object_oid.parse::<Oid>().map_err(|_| malformed())?;

        let desc = parse_description(rest).ok_or_else(|| {
            copydb_error!(
                ErrorKind::InvalidData,
                "Unknown archive entry description",
                format!("line: {line:?}")
            )
        })?;
        let tag = rest[desc.len()..].trim_start_matches(' ').to_string();

        let restore_list_name = match desc {
            "ACL" | "COMMENT" => composite_name(&tag),
            _ if tag.is_empty() => None,
            _ => Some(tag.clone()),
        };

        Ok(Self {
            dump_id,
            catalog_oid,
            object_oid,
            desc,
            tag,
            restore_list_name,
        })
    }
}

impl fmt::Display for TocEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}; {} {} {} {}",
            self.dump_id, self.catalog_oid, self.object_oid, self.desc, self.tag
        )
    }
}

/// The longest description that `rest` starts with as whole words.
fn parse_description(rest: &str) -> Option<&'static str> {
    DESCRIPTIONS
        .iter()
        .copied()
        .filter(|desc| {
            rest.strip_prefix(desc)
                .is_some_and(|after| after.is_empty() || after.starts_with(' '))
        })
        .max_by_key(|desc| desc.len())
}

/// Restore-list name of the object an `ACL` or `COMMENT` entry applies to.
///
/// Only schemas (`- SCHEMA name owner`) and extensions (`- EXTENSION name`) are resolved.
fn composite_name(tag: &str) -> Option<String> {
    if let Some(schema) = tag.strip_prefix("- SCHEMA ") {
        return Some(format!("- {schema}"));
    }

    tag.strip_prefix("- EXTENSION ")
        .and_then(|extension| extension.split(' ').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Parses a whole list, skipping blank and commented lines.
pub fn parse_toc(content: &str) -> CopyDbResult<Vec<TocEntry>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with(';'))
        .map(TocEntry::parse)
        .collect()
}

/// Whether an entry is restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocDecision {
    Restore,
    Filtered(FilterKind),
    /// Built by the copy already.
    Processed,
}

impl TocDecision {
    pub fn is_skipped(self) -> bool {
        self != TocDecision::Restore
    }
}

/// Decides which entries of a list are restored.
#[derive(Debug)]
pub struct TocFilter<'a> {
    filter: &'a Catalog,
    coordinator: Option<&'a Coordinator>,
    units: HashMap<Oid, WorkUnit>,
}

impl<'a> TocFilter<'a> {
    pub fn new(filter: &'a Catalog) -> Self {
        Self {
            filter,
            coordinator: None,
            units: HashMap::new(),
        }
    }

    /// Also skips the indexes and constraints the copy already built.
    pub async fn skip_processed(mut self, coordinator: &'a Coordinator) -> CopyDbResult<Self> {
        for index in coordinator.catalog().indexes().await? {
            self.units.insert(
                index.oid,
                WorkUnit::Index {
                    table_oid: index.table_oid,
                    index_oid: index.oid,
                },
            );

            if let Some(constraint) = &index.constraint {
                self.units.insert(
                    constraint.oid,
                    WorkUnit::Constraint {
                        table_oid: index.table_oid,
                        constraint_oid: constraint.oid,
                    },
                );
            }
        }

        self.coordinator = Some(coordinator);

        Ok(self)
    }

    pub async fn decide(&self, entry: &TocEntry) -> CopyDbResult<TocDecision> {
        if let (Some(coordinator), Some(unit)) =
            (self.coordinator, self.units.get(&entry.object_oid))
        {
            if coordinator.is_done(unit).await? {
                return Ok(TocDecision::Processed);
            }
        }

        let exclusion = lookup_exclusion(
            self.filter,
            entry.object_oid,
            entry.restore_list_name.as_deref(),
        )
        .await?;

        Ok(match exclusion {
            Some(exclusion) => TocDecision::Filtered(exclusion.kind),
            None => TocDecision::Restore,
        })
    }
}

/// Counts of a written list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TocSummary {
    pub restored: usize,
    pub filtered: usize,
    pub processed: usize,
}

/// Renders `entries` with the skipped ones commented out.
pub async fn render_filtered_toc(
    filter: &TocFilter<'_>,
    entries: &[TocEntry],
) -> CopyDbResult<(String, TocSummary)> {
    let mut list = String::new();
    let mut summary = TocSummary::default();

    for entry in entries {
        let decision = filter.decide(entry).await?;
        match decision {
            TocDecision::Restore => summary.restored += 1,
            TocDecision::Filtered(kind) => {
                summary.filtered += 1;
                debug!(dump_id = entry.dump_id, %kind, entry = %entry, "skipping filtered-out entry");
            }
            TocDecision::Processed => {
                summary.processed += 1;
                debug!(dump_id = entry.dump_id, entry = %entry, "skipping already processed entry");
            }
        }

        if decision.is_skipped() {
            list.push(';');
        }
        list.push_str(&entry.to_string());
        list.push('\n');
    }

    Ok((list, summary))
}

/// Filters the list in `input` and writes the result to `output`.
pub async fn write_filtered_toc(
    filter: &TocFilter<'_>,
    input: &Path,
    output: &Path,
) -> CopyDbResult<TocSummary> {
    let content = tokio::fs::read_to_string(input).await?;
    let entries = parse_toc(&content)?;

    let (list, summary) = render_filtered_toc(filter, &entries).await?;
    tokio::fs::write(output, list).await?;

    info!(
        restored = summary.restored,
        filtered = summary.filtered,
        processed = summary.processed,
        list = %output.display(),
        "wrote filtered archive list"
    );

    Ok(summary)
}
