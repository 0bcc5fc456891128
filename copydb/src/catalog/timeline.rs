//! Timeline history of the source server.

use serde::Serialize;
use sqlx::Row;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::copydb_error;
use crate::error::{CopyDbResult, ErrorKind};
use crate::types::{PgLsn, invalid_lsn, parse_lsn, parse_stored_lsn};

/// One timeline: WAL positions `startpos..endpos` belong to timeline `tli`.
///
/// The current timeline has no end, stored as `0/0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimelineHistoryEntry {
    pub tli: u32,
    #[serde(serialize_with = "serialize_lsn")]
    pub startpos: PgLsn,
    #[serde(serialize_with = "serialize_lsn")]
    pub endpos: PgLsn,
}

fn serialize_lsn<S: serde::Serializer>(lsn: &PgLsn, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(lsn)
}

/// Parses the content of a `.history` file, as returned by `TIMELINE_HISTORY`, for a server
/// currently on `current_tli`.
///
/// Every line reads `parent_tli<TAB>switch_lsn<TAB>reason`; blank lines and `#` comments are
/// skipped.
pub fn parse_timeline_history(
    content: &str,
    current_tli: u32,
) -> CopyDbResult<Vec<TimelineHistoryEntry>> {
    let mut entries = Vec::new();
    let mut startpos = invalid_lsn();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split('\t');
        let (Some(tli), Some(lsn)) = (fields.next(), fields.next()) else {
            return Err(copydb_error!(
                ErrorKind::InvalidData,
                "Malformed timeline history line",
                format!("line: {}, content: {line:?}", number + 1)
            ));
        };

        let tli = tli.trim().parse::<u32>().map_err(|err| {
            copydb_error!(
                ErrorKind::InvalidData,
                "Malformed timeline history line",
                detail = format!("line: {}, content: {line:?}", number + 1),
                source: err
            )
        })?;
        let endpos = parse_lsn(lsn.trim())?;

        entries.push(TimelineHistoryEntry {
            tli,
            startpos,
            endpos,
        });
        startpos = endpos;
    }

    entries.push(TimelineHistoryEntry {
        tli: current_tli,
        startpos,
        endpos: invalid_lsn(),
    });

    Ok(entries)
}

impl Catalog {
    pub async fn add_timeline_history(&self, entries: &[TimelineHistoryEntry]) -> CopyDbResult<()> {
        for entry in entries {
            let startpos = entry.startpos.to_string();
            let startpos = startpos.as_str();
            let endpos = entry.endpos.to_string();
            let endpos = endpos.as_str();

            self.run(Statement::TimelineInsert, |pool| async move {
                sqlx::query(Statement::TimelineInsert.sql())
                    .bind(entry.tli)
                    .bind(startpos)
                    .bind(endpos)
                    .execute(&pool)
                    .await
            })
            .await?;
        }

        Ok(())
    }

    pub async fn timeline_history(&self) -> CopyDbResult<Vec<TimelineHistoryEntry>> {
        let rows = self
            .run(Statement::TimelineSelectAll, |pool| async move {
                sqlx::query(Statement::TimelineSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        rows.iter()
            .map(|row| {
                Ok(TimelineHistoryEntry {
                    tli: row.get("tli"),
                    startpos: parse_stored_lsn(row.get("startpos"))?,
                    endpos: parse_stored_lsn(row.get("endpos"))?,
                })
            })
            .collect()
    }
}
