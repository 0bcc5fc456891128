//! Reader of transformed change files.
//!
//! A change file holds the SQL of the decoded transactions, one statement per line, framed by
//! metadata comments:
//!
//! ```text
//! BEGIN; -- {"xid":489,"lsn":"0/2406A48","commit_lsn":"0/2406B10"}
//! INSERT INTO "public"."items" ("id", "payload") VALUES (1, 'a');
//! COMMIT; -- {"xid":489,"lsn":"0/2406B10"}
//! -- KEEPALIVE {"lsn":"0/2406B48"}
//! -- SWITCH WAL {"lsn":"0/3000000"}
//! ```

use std::path::Path;

use futures::{Stream, stream};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::bail;
use crate::error::{CopyDbResult, ErrorKind};
use crate::replay::event::ReplayEvent;
use crate::types::{PgLsn, invalid_lsn, parse_lsn};

const BEGIN_PREFIX: &str = "BEGIN; -- ";
const COMMIT_PREFIX: &str = "COMMIT; -- ";
const KEEPALIVE_PREFIX: &str = "-- KEEPALIVE ";
const SWITCH_WAL_PREFIX: &str = "-- SWITCH WAL ";
const ENDPOS_PREFIX: &str = "-- ENDPOS ";

#[derive(Debug, Deserialize)]
struct Metadata {
    xid: Option<u32>,
    lsn: Option<String>,
    commit_lsn: Option<String>,
}

impl Metadata {
    fn parse(json: &str) -> CopyDbResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn lsn(&self, line: &str) -> CopyDbResult<PgLsn> {
        match &self.lsn {
            Some(lsn) => parse_lsn(lsn),
            None => bail!(
                ErrorKind::InvalidData,
                "Change metadata has no LSN",
                format!("line: {line:?}")
            ),
        }
    }
}

/// Turns the lines of a change file into events.
///
/// Statements inherit the position of the last framing line read.
#[derive(Debug, Default)]
pub struct SqlChangeParser {
    lsn: Option<PgLsn>,
}

impl SqlChangeParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one line; blank lines and plain comments yield no event.
    pub fn parse_line(&mut self, line: &str) -> CopyDbResult<Option<ReplayEvent>> {
        let line = line.trim_end();

        let event = if let Some(json) = line.strip_prefix(BEGIN_PREFIX) {
            let metadata = Metadata::parse(json)?;
            let Some(xid) = metadata.xid else {
                bail!(
                    ErrorKind::InvalidData,
                    "BEGIN metadata has no transaction id",
                    format!("line: {line:?}")
                );
            };
            let lsn = match &metadata.commit_lsn {
                Some(commit_lsn) => parse_lsn(commit_lsn)?,
                None => metadata.lsn(line)?,
            };

            ReplayEvent::Begin { xid, lsn }
        } else if let Some(json) = line.strip_prefix(COMMIT_PREFIX) {
            ReplayEvent::Commit {
                lsn: Metadata::parse(json)?.lsn(line)?,
            }
        } else if let Some(json) = line.strip_prefix(KEEPALIVE_PREFIX) {
            ReplayEvent::Keepalive {
                lsn: Metadata::parse(json)?.lsn(line)?,
            }
        } else if let Some(json) = line.strip_prefix(SWITCH_WAL_PREFIX) {
            ReplayEvent::SwitchWal {
                lsn: Metadata::parse(json)?.lsn(line)?,
            }
        } else if let Some(json) = line.strip_prefix(ENDPOS_PREFIX) {
            ReplayEvent::Endpos {
                lsn: Metadata::parse(json)?.lsn(line)?,
            }
        } else if line.is_empty() || line.starts_with("--") {
            return Ok(None);
        } else {
            return Ok(Some(ReplayEvent::Statement {
                lsn: self.lsn.unwrap_or_else(invalid_lsn),
                sql: line.to_string(),
            }));
        };

        self.lsn = Some(event.lsn());

        Ok(Some(event))
    }
}

/// Streams the events of the change file at `path`.
pub async fn read_sql_changes(
    path: &Path,
) -> CopyDbResult<impl Stream<Item = CopyDbResult<ReplayEvent>> + Send + use<>> {
    let file = tokio::fs::File::open(path).await?;
    let lines = BufReader::new(file).lines();

    Ok(sql_change_stream(lines, SqlChangeParser::new()))
}

fn sql_change_stream<R>(
    lines: Lines<R>,
    parser: SqlChangeParser,
) -> impl Stream<Item = CopyDbResult<ReplayEvent>> + Send
where
    R: tokio::io::AsyncBufRead + Unpin + Send,
{
    stream::unfold(Some((lines, parser)), |state| async move {
        let (mut lines, mut parser) = state?;

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                // The stream ends after reporting the error.
                Err(err) => return Some((Err(err.into()), None)),
            };

            match parser.parse_line(&line) {
                Ok(Some(event)) => return Some((Ok(event), Some((lines, parser)))),
                Ok(None) => continue,
                Err(err) => return Some((Err(err), None)),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn lsn(value: &str) -> PgLsn {
        parse_lsn(value).unwrap()
    }

    #[test]
    fn transactions_are_framed_by_their_commit_position() {
        let mut parser = SqlChangeParser::new();

        let begin = parser
            .parse_line(r#"BEGIN; -- {"xid":489,"lsn":"0/2406A48","commit_lsn":"0/2406B10"}"#)
            .unwrap();
        assert_eq!(
            begin,
            Some(ReplayEvent::Begin {
                xid: 489,
                lsn: lsn("0/2406B10"),
            })
        );

        let statement = parser
            .parse_line("INSERT INTO \"public\".\"items\" (\"id\") VALUES (1);")
            .unwrap();
        assert_eq!(
            statement,
            Some(ReplayEvent::Statement {
                lsn: lsn("0/2406B10"),
                sql: "INSERT INTO \"public\".\"items\" (\"id\") VALUES (1);".to_string(),
            })
        );

        let commit = parser
            .parse_line(r#"COMMIT; -- {"xid":489,"lsn":"0/2406B10"}"#)
            .unwrap();
        assert_eq!(commit, Some(ReplayEvent::Commit { lsn: lsn("0/2406B10") }));
    }

    #[test]
    fn control_lines_and_comments() {
        let mut parser = SqlChangeParser::new();

        assert_eq!(
            parser.parse_line(r#"-- KEEPALIVE {"lsn":"0/2406B48","timestamp":"2026-10-19 09:00:00"}"#).unwrap(),
            Some(ReplayEvent::Keepalive { lsn: lsn("0/2406B48") })
        );
        assert_eq!(
            parser.parse_line(r#"-- SWITCH WAL {"lsn":"0/3000000"}"#).unwrap(),
            Some(ReplayEvent::SwitchWal { lsn: lsn("0/3000000") })
        );
        assert_eq!(
            parser.parse_line(r#"-- ENDPOS {"lsn":"0/3000100"}"#).unwrap(),
            Some(ReplayEvent::Endpos { lsn: lsn("0/3000100") })
        );
        assert_eq!(parser.parse_line("").unwrap(), None);
        assert_eq!(parser.parse_line("-- generated by the transform").unwrap(), None);
    }

    #[test]
    fn malformed_metadata_is_rejected() {
        let mut parser = SqlChangeParser::new();

        let err = parser.parse_line("BEGIN; -- {\"xid\":").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);

        let err = parser
            .parse_line(r#"BEGIN; -- {"lsn":"0/10"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = parser
            .parse_line(r#"COMMIT; -- {"lsn":"not-an-lsn"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLsn);
    }

    #[tokio::test]
    async fn change_files_stream_their_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000010000000000000002.sql");
        let content = [
            r#"BEGIN; -- {"xid":500,"lsn":"0/2000010","commit_lsn":"0/2000090"}"#,
            "DELETE FROM \"public\".\"items\" WHERE \"id\" = 7;",
            r#"COMMIT; -- {"xid":500,"lsn":"0/2000090"}"#,
            "",
            r#"-- KEEPALIVE {"lsn":"0/20000A0"}"#,
        ]
        .join("\n");
        tokio::fs::write(&path, content).await.unwrap();

        let events: Vec<ReplayEvent> = read_sql_changes(&path)
            .await
            .unwrap()
            .map(|event| event.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ReplayEvent::Begin { xid: 500, lsn: lsn("0/2000090") });
        assert_eq!(events[3], ReplayEvent::Keepalive { lsn: lsn("0/20000A0") });
    }
}
