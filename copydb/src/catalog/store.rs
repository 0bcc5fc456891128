//! File-backed catalog stores.
//!
//! A [`Catalog`] is one SQLite database file dedicated to a [`CatalogRole`]. Handles are cheap
//! to clone and share the connection pool and the catalog semaphore, so every worker of a run
//! can hold its own handle.
//!
//! Contention is handled by the store itself: connections never wait inside SQLite
//! (`busy_timeout` is zero) and every statement outside an explicit transaction, as well as
//! every `BEGIN IMMEDIATE`, goes through the busy retry policy.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection};
use tracing::{debug, error, info};

use crate::catalog::ddl;
use crate::catalog::retry::{BusyBackoff, BusyRetryPolicy, is_busy, retry_on_busy};
use crate::catalog::sql::Statement;
use crate::concurrency::semaphore::{CatalogPermit, CatalogSemaphore};
use crate::error::{CopyDbError, CopyDbResult, ErrorKind};
use crate::{bail, copydb_error};

const MAX_CONNECTIONS: u32 = 8;

/// Role of a catalog within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogRole {
    /// Objects retained for the migration, plus run progress and replay state.
    Source,
    /// Objects excluded by the filtering rules.
    Filter,
    /// Objects already present on the target server.
    Target,
}

impl CatalogRole {
    pub fn as_str(self) -> &'static str {
        match self {
            CatalogRole::Source => "source",
            CatalogRole::Filter => "filter",
            CatalogRole::Target => "target",
        }
    }

    /// File name of the catalog within the schema directory.
    pub fn file_name(self) -> &'static str {
        match self {
            CatalogRole::Source => "source.db",
            CatalogRole::Filter => "filter.db",
            CatalogRole::Target => "target.db",
        }
    }
}

impl fmt::Display for CatalogRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct CatalogInner {
    role: CatalogRole,
    path: PathBuf,
    pool: Mutex<Option<SqlitePool>>,
    semaphore: CatalogSemaphore,
    retry: BusyRetryPolicy,
}

/// Handle on one catalog file.
#[derive(Debug, Clone)]
pub struct Catalog {
    inner: Arc<CatalogInner>,
}

impl Catalog {
    /// Creates a closed handle on the catalog stored at `path`.
    pub fn new(role: CatalogRole, path: impl Into<PathBuf>) -> Self {
        Self::with_retry_policy(role, path, BusyRetryPolicy::default())
    }

    pub fn with_retry_policy(
        role: CatalogRole,
        path: impl Into<PathBuf>,
        retry: BusyRetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(CatalogInner {
                role,
                path: path.into(),
                pool: Mutex::new(None),
                semaphore: CatalogSemaphore::new(),
                retry,
            }),
        }
    }

    pub fn role(&self) -> CatalogRole {
        self.inner.role
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn semaphore(&self) -> &CatalogSemaphore {
        &self.inner.semaphore
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Opens the catalog, creating the file and its schema when it does not exist yet.
    ///
    /// Opening an already open catalog is a no-op.
    pub async fn init(&self) -> CopyDbResult<()> {
        if self.is_open() {
            debug!(catalog = %self.role(), "catalog already open");
            return Ok(());
        }

        let exists = tokio::fs::try_exists(self.path()).await?;

        if !exists {
            if let Some(parent) = self.path().parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = self.connect().await?;

        if !exists {
            info!(
                catalog = %self.role(),
                path = %self.path().display(),
                "creating catalog schema"
            );

            if let Err(err) = apply_ddl(&pool, self.role(), ddl::create_statements(self.role())).await
            {
                pool.close().await;
                return Err(err);
            }
        }

        let previous = self
            .inner
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(pool);

        // Another handle raced this one; keep the newest pool.
        if let Some(previous) = previous {
            previous.close().await;
        }

        Ok(())
    }

    /// Opens an existing catalog.
    pub async fn open(&self) -> CopyDbResult<()> {
        if !tokio::fs::try_exists(self.path()).await? {
            bail!(
                ErrorKind::CatalogNotFound,
                "Catalog file does not exist",
                format!("catalog: {}, path: {}", self.role(), self.path().display())
            );
        }

        self.init().await
    }

    /// Closes the catalog. Closing a closed catalog is a no-op.
    pub async fn close(&self) {
        let pool = self
            .inner
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(pool) = pool {
            pool.close().await;
            debug!(catalog = %self.role(), "catalog closed");
        }
    }

    /// Creates the tables of this catalog's role.
    pub async fn create_schema(&self) -> CopyDbResult<()> {
        let pool = self.pool()?;
        apply_ddl(&pool, self.role(), ddl::create_statements(self.role())).await
    }

    /// Drops the tables of this catalog's role.
    pub async fn drop_schema(&self) -> CopyDbResult<()> {
        let pool = self.pool()?;
        apply_ddl(&pool, self.role(), ddl::drop_statements(self.role())).await
    }

    /// Starts an immediate transaction, retrying while another writer holds the lock.
    pub async fn begin(&self) -> CopyDbResult<CatalogTransaction> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;

        begin_immediate(&mut conn, &self.inner.retry)
            .await
            .map_err(|err| self.statement_error(Statement::BeginImmediate, err))?;

        Ok(CatalogTransaction {
            role: self.role(),
            conn: Some(conn),
        })
    }

    /// Makes `other` queryable under `alias` on a dedicated connection of this catalog.
    pub async fn attach(&self, other: &Catalog, alias: &str) -> CopyDbResult<AttachedCatalog> {
        if alias.is_empty() || !alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!(
                ErrorKind::CatalogAttachFailed,
                "Invalid catalog alias",
                format!("alias: {alias:?}")
            );
        }

        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        let sql = format!("{} {alias}", Statement::Attach.sql());
        let path = other.path().to_string_lossy().into_owned();

        let mut backoff = BusyBackoff::new(self.inner.retry);
        loop {
            match sqlx::query(&sql).bind(&path).execute(&mut *conn).await {
                Ok(_) => break,
                Err(err) if is_busy(&err) && backoff.wait().await => continue,
                Err(err) => {
                    error!(
                        catalog = %self.role(),
                        attached = %other.role(),
                        error = %err,
                        "failed to attach catalog"
                    );
                    drop(conn.detach());

                    return Err(copydb_error!(
                        ErrorKind::CatalogAttachFailed,
                        "Failed to attach catalog",
                        detail = format!("statement: {sql}, path: {path}, error: {err}"),
                        source: err
                    ));
                }
            }
        }

        debug!(catalog = %self.role(), attached = %other.role(), alias, "catalog attached");

        Ok(AttachedCatalog {
            role: self.role(),
            alias: alias.to_string(),
            retry: self.inner.retry,
            conn: Some(conn),
        })
    }

    pub(crate) fn pool(&self) -> CopyDbResult<SqlitePool> {
        match &*self.inner.pool.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(pool) => Ok(pool.clone()),
            None => bail!(
                ErrorKind::CatalogNotOpen,
                "Catalog is not open",
                format!("catalog: {}", self.role())
            ),
        }
    }

    /// Runs one statement on the pool, retrying while the store is busy.
    pub(crate) async fn run<T, F, Fut>(&self, statement: Statement, op: F) -> CopyDbResult<T>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let pool = self.pool()?;

        retry_on_busy(&self.inner.retry, || op(pool.clone()))
            .await
            .map_err(|err| self.statement_error(statement, err))
    }

    /// Same as [`Catalog::run`] while holding the catalog semaphore.
    pub(crate) async fn run_locked<T, F, Fut>(&self, statement: Statement, op: F) -> CopyDbResult<T>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let _permit = self.lock().await?;
        self.run(statement, op).await
    }

    /// Acquires the catalog semaphore.
    pub async fn lock(&self) -> CopyDbResult<CatalogPermit> {
        self.inner.semaphore.lock().await
    }

    pub(crate) fn statement_error(&self, statement: Statement, err: sqlx::Error) -> CopyDbError {
        statement_error(self.role(), statement, err)
    }

    async fn connect(&self) -> CopyDbResult<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(self.path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::ZERO)
            .foreign_keys(false);

        let pool_options = SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS);

        let pool = retry_on_busy(&self.inner.retry, || {
            pool_options.clone().connect_with(options.clone())
        })
        .await
        .map_err(|err| {
            error!(
                catalog = %self.role(),
                path = %self.path().display(),
                error = %err,
                "failed to open catalog"
            );
            copydb_error!(
                ErrorKind::CatalogNotOpen,
                "Failed to open catalog",
                detail = format!("path: {}, error: {err}", self.path().display()),
                source: err
            )
        })?;

        Ok(pool)
    }
}

/// Builds the error of a failed statement, logging it where it occurs.
pub(crate) fn statement_error(
    role: CatalogRole,
    statement: Statement,
    err: sqlx::Error,
) -> CopyDbError {
    error!(
        catalog = %role,
        statement = ?statement,
        error = %err,
        "catalog statement failed"
    );

    let kind = if is_busy(&err) {
        ErrorKind::CatalogBusy
    } else {
        ErrorKind::CatalogQueryFailed
    };

    copydb_error!(
        kind,
        "Catalog statement failed",
        detail = format!(
            "catalog: {role}, statement: {}, error: {err}",
            statement.sql()
        ),
        source: err
    )
}

async fn apply_ddl(pool: &SqlitePool, role: CatalogRole, statements: &[&str]) -> CopyDbResult<()> {
    let mut conn = pool.acquire().await?;

    for statement in statements {
        if let Err(err) = sqlx::query(statement).execute(&mut *conn).await {
            error!(catalog = %role, statement, error = %err, "catalog schema statement failed");

            bail!(
                ErrorKind::CatalogSchemaFailed,
                "Failed to apply catalog schema",
                detail = format!("catalog: {role}, statement: {statement}, error: {err}"),
                source: err
            );
        }
    }

    Ok(())
}

async fn begin_immediate(
    conn: &mut SqliteConnection,
    retry: &BusyRetryPolicy,
) -> Result<(), sqlx::Error> {
    let mut backoff = BusyBackoff::new(*retry);

    loop {
        match sqlx::query(Statement::BeginImmediate.sql())
            .execute(&mut *conn)
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) if is_busy(&err) && backoff.wait().await => continue,
            Err(err) => return Err(err),
        }
    }
}

/// An immediate transaction on one catalog connection.
///
/// Dropping an uncommitted transaction closes its connection, which rolls it back.
pub struct CatalogTransaction {
    role: CatalogRole,
    conn: Option<PoolConnection<Sqlite>>,
}

impl CatalogTransaction {
    pub(crate) fn conn(&mut self) -> CopyDbResult<&mut SqliteConnection> {
        match self.conn.as_deref_mut() {
            Some(conn) => Ok(conn),
            None => bail!(ErrorKind::InvalidState, "Catalog transaction already finished"),
        }
    }

    pub(crate) fn statement_error(&self, statement: Statement, err: sqlx::Error) -> CopyDbError {
        statement_error(self.role, statement, err)
    }

    pub async fn commit(mut self) -> CopyDbResult<()> {
        let result = sqlx::query(Statement::Commit.sql())
            .execute(self.conn()?)
            .await;

        match result {
            Ok(_) => {
                // Back to the pool, outside any transaction.
                self.conn.take();
                Ok(())
            }
            Err(err) => Err(self.statement_error(Statement::Commit, err)),
        }
    }

    pub async fn rollback(mut self) -> CopyDbResult<()> {
        let result = sqlx::query(Statement::Rollback.sql())
            .execute(self.conn()?)
            .await;

        match result {
            Ok(_) => {
                self.conn.take();
                Ok(())
            }
            Err(err) => Err(self.statement_error(Statement::Rollback, err)),
        }
    }
}

impl Drop for CatalogTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

impl fmt::Debug for CatalogTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogTransaction")
            .field("role", &self.role)
            .field("active", &self.conn.is_some())
            .finish()
    }
}

/// A catalog connection with another catalog attached.
pub struct AttachedCatalog {
    role: CatalogRole,
    alias: String,
    retry: BusyRetryPolicy,
    conn: Option<PoolConnection<Sqlite>>,
}

impl AttachedCatalog {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Runs one statement that may read the attached catalog, inside its own immediate
    /// transaction.
    pub(crate) async fn execute(&mut self, statement: Statement) -> CopyDbResult<u64> {
        let role = self.role;
        let retry = self.retry;
        let conn = match self.conn.as_deref_mut() {
            Some(conn) => conn,
            None => bail!(ErrorKind::InvalidState, "Catalog was already detached"),
        };

        begin_immediate(conn, &retry)
            .await
            .map_err(|err| statement_error(role, Statement::BeginImmediate, err))?;

        let rows = match sqlx::query(statement.sql()).execute(&mut *conn).await {
            Ok(result) => result.rows_affected(),
            Err(err) => {
                // The connection is discarded on drop, which also rolls back.
                self.discard();
                return Err(statement_error(role, statement, err));
            }
        };

        if let Err(err) = sqlx::query(Statement::Commit.sql()).execute(&mut *conn).await {
            self.discard();
            return Err(statement_error(role, Statement::Commit, err));
        }

        Ok(rows)
    }

    /// Detaches the attached catalog and returns the connection to the pool.
    pub async fn detach(mut self) -> CopyDbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let sql = format!("detach database {}", self.alias);
        if let Err(err) = sqlx::query(&sql).execute(&mut *conn).await {
            drop(conn.detach());
            bail!(
                ErrorKind::CatalogAttachFailed,
                "Failed to detach catalog",
                detail = format!("statement: {sql}, error: {err}"),
                source: err
            );
        }

        Ok(())
    }

    fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

impl Drop for AttachedCatalog {
    fn drop(&mut self) {
        self.discard();
    }
}

impl fmt::Debug for AttachedCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedCatalog")
            .field("role", &self.role)
            .field("alias", &self.alias)
            .finish()
    }
}

/// The three catalogs of a run.
#[derive(Debug, Clone)]
pub struct Catalogs {
    pub source: Catalog,
    pub filter: Catalog,
    pub target: Catalog,
}

impl Catalogs {
    /// Handles on the catalogs stored in `schema_dir`.
    pub fn new(schema_dir: &Path) -> Self {
        Self {
            source: Catalog::new(
                CatalogRole::Source,
                schema_dir.join(CatalogRole::Source.file_name()),
            ),
            filter: Catalog::new(
                CatalogRole::Filter,
                schema_dir.join(CatalogRole::Filter.file_name()),
            ),
            target: Catalog::new(
                CatalogRole::Target,
                schema_dir.join(CatalogRole::Target.file_name()),
            ),
        }
    }

    pub fn all(&self) -> [&Catalog; 3] {
        [&self.source, &self.filter, &self.target]
    }

    pub async fn init(&self) -> CopyDbResult<()> {
        for catalog in self.all() {
            catalog.init().await?;
        }

        Ok(())
    }

    pub async fn open(&self) -> CopyDbResult<()> {
        for catalog in self.all() {
            catalog.open().await?;
        }

        Ok(())
    }

    pub async fn close(&self) {
        for catalog in self.all() {
            catalog.close().await;
        }
    }
}
