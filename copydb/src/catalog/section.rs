//! Section bookkeeping: which metadata phases were already fetched into a catalog.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::bail;
use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::{CopyDbError, CopyDbResult, ErrorKind};

/// A named phase of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Section {
    DatabaseProperties,
    Collations,
    #[serde(rename = "extension")]
    Extensions,
    Schema,
    TableData,
    TableDataParts,
    SetSequences,
    Indexes,
    Constraints,
    #[serde(rename = "pg_depend")]
    Depends,
    Filters,
    LargeObjects,
    Vacuum,
    All,
    Namespaces,
}

impl Section {
    pub const ALL: [Section; 15] = [
        Section::DatabaseProperties,
        Section::Collations,
        Section::Extensions,
        Section::Schema,
        Section::TableData,
        Section::TableDataParts,
        Section::SetSequences,
        Section::Indexes,
        Section::Constraints,
        Section::Depends,
        Section::Filters,
        Section::LargeObjects,
        Section::Vacuum,
        Section::All,
        Section::Namespaces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Section::DatabaseProperties => "database-properties",
            Section::Collations => "collations",
            Section::Extensions => "extension",
            Section::Schema => "schema",
            Section::TableData => "table-data",
            Section::TableDataParts => "table-data-parts",
            Section::SetSequences => "set-sequences",
            Section::Indexes => "indexes",
            Section::Constraints => "constraints",
            Section::Depends => "pg_depend",
            Section::Filters => "filters",
            Section::LargeObjects => "large-objects",
            Section::Vacuum => "vacuum",
            Section::All => "all",
            Section::Namespaces => "namespaces",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Section {
    type Err = CopyDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Section::ALL.iter().find(|section| section.as_str() == s) {
            Some(section) => Ok(*section),
            None => bail!(
                ErrorKind::InvalidData,
                "Unknown section name",
                format!("section: {s:?}")
            ),
        }
    }
}

/// Stored state of a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionState {
    pub section: Section,
    pub fetched: bool,
    pub start_time_epoch: Option<i64>,
    pub done_time_epoch: Option<i64>,
    /// Milliseconds.
    pub duration: Option<i64>,
}

impl SectionState {
    fn unfetched(section: Section) -> Self {
        Self {
            section,
            fetched: false,
            start_time_epoch: None,
            done_time_epoch: None,
            duration: None,
        }
    }
}

impl Catalog {
    /// Returns the state of `section`, unfetched when never recorded.
    pub async fn section(&self, section: Section) -> CopyDbResult<SectionState> {
        let name = section.as_str();
        let row = self
            .run(Statement::SectionSelect, |pool| async move {
                sqlx::query(Statement::SectionSelect.sql())
                    .bind(name)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        match row {
            Some(row) => Ok(SectionState {
                section,
                fetched: row.get("fetched"),
                start_time_epoch: row.get("start_time_epoch"),
                done_time_epoch: row.get("done_time_epoch"),
                duration: row.get("duration"),
            }),
            None => Ok(SectionState::unfetched(section)),
        }
    }

    /// Records that `section` was fetched between `start` and `done`.
    ///
    /// A section is fetched at most once per catalog: marking it again only refreshes its
    /// timings.
    pub async fn mark_section_fetched(
        &self,
        section: Section,
        start: DateTime<Utc>,
        done: DateTime<Utc>,
    ) -> CopyDbResult<()> {
        let name = section.as_str();
        let duration = (done - start).num_milliseconds();

        self.run(Statement::SectionUpsert, |pool| async move {
            sqlx::query(Statement::SectionUpsert.sql())
                .bind(name)
                .bind(true)
                .bind(start.timestamp())
                .bind(done.timestamp())
                .bind(duration)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn sections(&self) -> CopyDbResult<Vec<SectionState>> {
        let rows = self
            .run(Statement::SectionSelectAll, |pool| async move {
                sqlx::query(Statement::SectionSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                let name: String = row.get("name");
                Ok(SectionState {
                    section: name.parse()?,
                    fetched: row.get("fetched"),
                    start_time_epoch: row.get("start_time_epoch"),
                    done_time_epoch: row.get("done_time_epoch"),
                    duration: row.get("duration"),
                })
            })
            .collect()
    }
}
