use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::catalog::{Depend, SourceIndex, TableChecksum};
use crate::clients::{Connector, CopySpec, SourceClient, SourceSchema, TargetClient};
use crate::copydb_error;
use crate::error::{CopyDbResult, ErrorKind};
use crate::test_utils::notify::TimedNotify;
use crate::types::{Oid, PgLsn};

/// Bytes reported per copied row.
pub const ROW_BYTES: u64 = 100;

/// Snapshot returned by every [`MemorySource::export_snapshot`].
pub const MEMORY_SNAPSHOT: &str = "00000003-00000002-1";

/// A server-side operation recorded by the [`MemoryServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect(Side),
    ExportSnapshot,
    SetSnapshot(String),
    /// A statement run on the target.
    Execute(String),
    /// A successful copy of a table or of one of its parts.
    Copy { qname: String, partnum: Option<u32> },
    /// A copy failing with an injected error.
    FailedCopy { qname: String, partnum: Option<u32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Target,
}

/// An injected failure, firing `remaining` more times.
#[derive(Debug, Clone)]
struct Failure {
    remaining: u32,
    kind: ErrorKind,
}

impl Failure {
    fn fire(&mut self) -> Option<ErrorKind> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        Some(self.kind)
    }
}

#[derive(Debug, Default)]
struct Inner {
    schema: SourceSchema,
    depends: Vec<Depend>,
    /// Rows of each source table, keyed `1..=rows` on the part key.
    source_rows: HashMap<String, i64>,
    sequence_values: HashMap<String, (i64, bool)>,
    /// Key ranges copied to the target, by table and part number; 0 is the whole table.
    target_rows: HashMap<String, HashMap<u32, (i64, i64)>>,
    target_indexes: Vec<SourceIndex>,
    journal: Vec<Operation>,
    copy_failures: HashMap<String, Failure>,
    connect_failures: HashMap<Side, Failure>,
    statement_failures: Vec<(String, Failure)>,
    copy_delay: Option<Duration>,
    wal_lsn: u64,
    copies: u64,
    copy_conditions: Vec<(u64, Arc<Notify>)>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let copies = self.copies;
        self.copy_conditions.retain(|(count, notify)| {
            let reached = copies >= *count;
            if reached {
                notify.notify_one();
            }
            !reached
        });
    }
}

/// A source and a target server held in memory.
///
/// Clones share the same servers, so a test keeps one handle to configure failures and
/// inspect the journal while the copy runs with another.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryServer {
    pub fn new(schema: SourceSchema) -> Self {
        let source_rows = schema
            .tables
            .iter()
            .map(|table| (table.qname.clone(), table.reltuples.max(0)))
            .collect();

        Self {
            inner: Arc::new(Mutex::new(Inner {
                schema,
                source_rows,
                wal_lsn: 0x0100_0000,
                ..Inner::default()
            })),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    pub async fn set_depends(&self, depends: Vec<Depend>) {
        self.inner.lock().await.depends = depends;
    }

    pub async fn set_source_rows(&self, qname: &str, rows: i64) {
        self.inner
            .lock()
            .await
            .source_rows
            .insert(qname.to_owned(), rows);
    }

    pub async fn set_sequence_value(&self, qname: &str, last_value: i64, is_called: bool) {
        self.inner
            .lock()
            .await
            .sequence_values
            .insert(qname.to_owned(), (last_value, is_called));
    }

    /// Indexes reported as already present on the target.
    pub async fn set_target_indexes(&self, indexes: Vec<SourceIndex>) {
        self.inner.lock().await.target_indexes = indexes;
    }

    pub async fn set_wal_lsn(&self, lsn: PgLsn) {
        self.inner.lock().await.wal_lsn = u64::from(lsn);
    }

    /// Delays every copy, leaving time for a test to act while units are in flight.
    pub async fn set_copy_delay(&self, delay: Duration) {
        self.inner.lock().await.copy_delay = Some(delay);
    }

    /// Fails the next `times` copies of `qname` with an error of `kind`.
    pub async fn fail_copies(&self, qname: &str, times: u32, kind: ErrorKind) {
        self.inner.lock().await.copy_failures.insert(
            qname.to_owned(),
            Failure {
                remaining: times,
                kind,
            },
        );
    }

    /// Fails the next `times` connections to `side`.
    pub async fn fail_connections(&self, side: Side, times: u32) {
        let kind = match side {
            Side::Source => ErrorKind::SourceConnectionFailed,
            Side::Target => ErrorKind::TargetConnectionFailed,
        };
        self.inner.lock().await.connect_failures.insert(
            side,
            Failure {
                remaining: times,
                kind,
            },
        );
    }

    /// Fails the next `times` target statements containing `pattern`.
    pub async fn fail_statements(&self, pattern: &str, times: u32) {
        self.inner.lock().await.statement_failures.push((
            pattern.to_owned(),
            Failure {
                remaining: times,
                kind: ErrorKind::TargetQueryFailed,
            },
        ));
    }

    pub async fn journal(&self) -> Vec<Operation> {
        self.inner.lock().await.journal.clone()
    }

    /// Statements run on the target, in order.
    pub async fn executed(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .journal
            .iter()
            .filter_map(|operation| match operation {
                Operation::Execute(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Successful copies of `qname`, as part numbers; `None` for a whole table copy.
    pub async fn copies_of(&self, qname: &str) -> Vec<Option<u32>> {
        self.inner
            .lock()
            .await
            .journal
            .iter()
            .filter_map(|operation| match operation {
                Operation::Copy { qname: copied, partnum } if copied == qname => Some(*partnum),
                _ => None,
            })
            .collect()
    }

    pub async fn failed_copies(&self) -> usize {
        self.inner
            .lock()
            .await
            .journal
            .iter()
            .filter(|operation| matches!(operation, Operation::FailedCopy { .. }))
            .count()
    }

    /// Rows of `qname` present on the target.
    pub async fn target_rows(&self, qname: &str) -> i64 {
        let inner = self.inner.lock().await;
        inner
            .target_rows
            .get(qname)
            .map(|parts| parts.values().map(|(low, high)| range_len(*low, *high)).sum())
            .unwrap_or_default()
    }

    /// Notified once `count` copies succeeded.
    pub async fn notify_on_copies(&self, count: u64) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().await;
        inner.copy_conditions.push((count, notify.clone()));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    async fn connect(&self, side: Side) -> CopyDbResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(kind) = inner
            .connect_failures
            .get_mut(&side)
            .and_then(Failure::fire)
        {
            return Err(copydb_error!(
                kind,
                "Connection refused",
                format!("side: {side:?}")
            ));
        }
        inner.journal.push(Operation::Connect(side));

        Ok(())
    }

    async fn copy(&self, copy: &CopySpec) -> CopyDbResult<u64> {
        let delay = self.inner.lock().await.copy_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        let partnum = copy.part.map(|part| part.partnum);

        if let Some(kind) = inner
            .copy_failures
            .get_mut(&copy.qname)
            .and_then(Failure::fire)
        {
            inner.journal.push(Operation::FailedCopy {
                qname: copy.qname.clone(),
                partnum,
            });
            return Err(copydb_error!(
                kind,
                "Connection lost during COPY",
                format!("table: {copy}")
            ));
        }

        let rows = inner.source_rows.get(&copy.qname).copied().unwrap_or_default();
        let (low, high) = match &copy.part {
            Some(part) => (part.min.unwrap_or(1).max(1), part.max.unwrap_or(rows).min(rows)),
            None => (1, rows),
        };

        inner
            .target_rows
            .entry(copy.qname.clone())
            .or_default()
            .insert(partnum.unwrap_or(0), (low, high));
        inner.journal.push(Operation::Copy {
            qname: copy.qname.clone(),
            partnum,
        });
        inner.copies += 1;
        inner.check_conditions();

        Ok(range_len(low, high) as u64 * ROW_BYTES)
    }
}

fn range_len(low: i64, high: i64) -> i64 {
    (high - low + 1).max(0)
}

/// Checksum of the keys `low..=high`, summed per range.
fn checksum<'a>(ranges: impl Iterator<Item = &'a (i64, i64)>) -> TableChecksum {
    let mut rowcount = 0;
    let mut sum: i128 = 0;
    for (low, high) in ranges {
        let len = range_len(*low, *high);
        if len == 0 {
            continue;
        }
        rowcount += len;
        sum += (*low as i128 + *high as i128) * len as i128 / 2;
    }

    TableChecksum {
        rowcount,
        checksum: format!("{sum:x}"),
    }
}

/// A [`Connector`] over a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

impl MemoryConnector {
    pub fn server(&self) -> &MemoryServer {
        &self.server
    }
}

#[derive(Debug)]
pub struct MemorySource {
    server: MemoryServer,
    snapshot: Option<String>,
}

impl MemorySource {
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }
}

#[derive(Debug)]
pub struct MemoryTarget {
    server: MemoryServer,
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn export_snapshot(&mut self) -> CopyDbResult<String> {
        self.server
            .inner
            .lock()
            .await
            .journal
            .push(Operation::ExportSnapshot);
        self.snapshot = Some(MEMORY_SNAPSHOT.to_owned());

        Ok(MEMORY_SNAPSHOT.to_owned())
    }

    async fn set_snapshot(&mut self, snapshot: &str) -> CopyDbResult<()> {
        self.server
            .inner
            .lock()
            .await
            .journal
            .push(Operation::SetSnapshot(snapshot.to_owned()));
        self.snapshot = Some(snapshot.to_owned());

        Ok(())
    }

    async fn fetch_schema(&mut self) -> CopyDbResult<SourceSchema> {
        Ok(self.server.inner.lock().await.schema.clone())
    }

    async fn fetch_depends(&mut self, relations: &[Oid]) -> CopyDbResult<Vec<Depend>> {
        let inner = self.server.inner.lock().await;
        Ok(inner
            .depends
            .iter()
            .filter(|depend| relations.contains(&depend.refobjid))
            .cloned()
            .collect())
    }

    async fn key_range(&mut self, qname: &str, _column: &str) -> CopyDbResult<Option<(i64, i64)>> {
        let inner = self.server.inner.lock().await;
        let rows = inner.source_rows.get(qname).copied().unwrap_or_default();

        Ok((rows > 0).then_some((1, rows)))
    }

    async fn table_checksum(&mut self, qname: &str) -> CopyDbResult<TableChecksum> {
        let inner = self.server.inner.lock().await;
        let rows = inner.source_rows.get(qname).copied().unwrap_or_default();

        Ok(checksum([(1, rows)].iter()))
    }

    async fn sequence_value(&mut self, qname: &str) -> CopyDbResult<(i64, bool)> {
        let inner = self.server.inner.lock().await;
        Ok(inner
            .sequence_values
            .get(qname)
            .copied()
            .unwrap_or((1, false)))
    }

    async fn current_wal_lsn(&mut self) -> CopyDbResult<PgLsn> {
        Ok(PgLsn::from(self.server.inner.lock().await.wal_lsn))
    }
}

#[async_trait]
impl TargetClient for MemoryTarget {
    async fn execute(&mut self, sql: &str) -> CopyDbResult<u64> {
        let mut inner = self.server.inner.lock().await;
        let failure = inner
            .statement_failures
            .iter_mut()
            .filter(|(pattern, _)| sql.contains(pattern.as_str()))
            .find_map(|(_, failure)| failure.fire());
        if let Some(kind) = failure {
            return Err(copydb_error!(kind, "Statement failed on the target", sql.to_owned()));
        }

        if let Some(qname) = sql.strip_prefix("truncate only ") {
            inner.target_rows.remove(qname.trim());
        }
        inner.journal.push(Operation::Execute(sql.to_owned()));

        Ok(0)
    }

    async fn fetch_indexes(&mut self) -> CopyDbResult<Vec<SourceIndex>> {
        Ok(self.server.inner.lock().await.target_indexes.clone())
    }

    async fn table_checksum(&mut self, qname: &str) -> CopyDbResult<TableChecksum> {
        let inner = self.server.inner.lock().await;
        let ranges: Vec<(i64, i64)> = inner
            .target_rows
            .get(qname)
            .map(|parts| parts.values().copied().collect())
            .unwrap_or_default();

        Ok(checksum(ranges.iter()))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Source = MemorySource;
    type Target = MemoryTarget;

    async fn connect_source(&self) -> CopyDbResult<MemorySource> {
        self.server.connect(Side::Source).await?;

        Ok(MemorySource {
            server: self.server.clone(),
            snapshot: None,
        })
    }

    async fn connect_target(&self) -> CopyDbResult<MemoryTarget> {
        self.server.connect(Side::Target).await?;

        Ok(MemoryTarget {
            server: self.server.clone(),
        })
    }

    async fn copy_rows(
        &self,
        _source: &mut MemorySource,
        _target: &mut MemoryTarget,
        copy: &CopySpec,
    ) -> CopyDbResult<u64> {
        self.server.copy(copy).await
    }
}
