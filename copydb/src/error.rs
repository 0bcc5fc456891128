//! Error types and result definitions for copydb operations.
//!
//! [`CopyDbError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail (statement text, qualified names, both sides of a mismatch), an optional
//! source error, the caller location and a captured backtrace. Worker pools aggregate the
//! failures of many work units into a single error.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the crate.
pub type CopyDbResult<T> = Result<T, CopyDbError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the crate.
#[derive(Debug, Clone)]
pub struct CopyDbError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Failures of several workers or work units.
    Many {
        errors: Vec<CopyDbError>,
        location: &'static Location<'static>,
    },
}

/// Classification of copydb failures, grouped by the layer that raises them.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Catalog store
    CatalogNotFound,
    CatalogNotOpen,
    CatalogSchemaFailed,
    CatalogAttachFailed,
    CatalogQueryFailed,
    /// Lock contention outlasted the busy retry budget.
    CatalogBusy,

    // Configuration
    ConfigError,
    /// The on-disk setup record disagrees with the current run.
    ConfigMismatch,

    // Work coordination
    InvalidMarker,
    DuplicateRun,
    QueueClosed,

    // Workers
    WorkUnitFailed,
    /// A worker task panicked; the detail names the worker type.
    WorkerPanic,

    // Source and target servers
    SourceConnectionFailed,
    TargetConnectionFailed,
    SourceQueryFailed,
    TargetQueryFailed,

    // Data
    InvalidData,
    InvalidLsn,
    ChecksumMismatch,

    // IO and serialization
    IoError,
    DeserializationError,

    // State
    InvalidState,

    Unknown,

    // Used by failpoint tests to simulate crashes between protocol steps.
    #[cfg(feature = "failpoints")]
    InjectedFailure,
}

impl CopyDbError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattened.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => {
                errors.iter().flat_map(|err| err.kinds()).collect()
            }
        }
    }

    /// Returns the aggregated errors, if this error wraps several.
    pub fn errors(&self) -> Option<&[CopyDbError]> {
        match self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { ref errors, .. } => Some(errors),
        }
    }

    /// Returns the dynamic detail, or the first one found among aggregated errors.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    /// Whether this failure belongs to the connection-exception class.
    ///
    /// Only those failures are retried by the bulk copy.
    pub fn is_connection_failure(&self) -> bool {
        let kinds = self.kinds();

        !kinds.is_empty()
            && kinds.iter().all(|kind| {
                matches!(
                    kind,
                    ErrorKind::SourceConnectionFailed | ErrorKind::TargetConnectionFailed
                )
            })
    }

    /// Attaches an originating error. Has no effect on aggregated errors.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        CopyDbError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }
}

impl fmt::Display for CopyDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_indented(f, "Detail:", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_indented(f, "Backtrace:", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                let count = errors.len();
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    count,
                    if count == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

fn write_indented(f: &mut fmt::Formatter<'_>, header: &str, body: &str) -> fmt::Result {
    if body.trim().is_empty() {
        return write!(f, "\n  {header} <empty>");
    }

    write!(f, "\n  {header}")?;
    for line in body.lines() {
        if line.trim().is_empty() {
            write!(f, "\n    ")?;
        } else {
            write!(f, "\n    {line}")?;
        }
    }

    Ok(())
}

impl error::Error for CopyDbError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CopyDbError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> CopyDbError {
        CopyDbError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for CopyDbError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> CopyDbError {
        CopyDbError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors; a single error is returned unwrapped.
impl<E> From<Vec<E>> for CopyDbError
where
    E: Into<CopyDbError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> CopyDbError {
        let location = Location::caller();
        let mut errors: Vec<CopyDbError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        CopyDbError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for CopyDbError {
    #[track_caller]
    fn from(err: std::io::Error) -> CopyDbError {
        let detail = err.to_string();
        CopyDbError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for CopyDbError {
    #[track_caller]
    fn from(err: serde_json::Error) -> CopyDbError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        let detail = err.to_string();
        CopyDbError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<std::num::ParseIntError> for CopyDbError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> CopyDbError {
        let detail = err.to_string();
        CopyDbError::from_components(
            ErrorKind::InvalidData,
            Cow::Borrowed("Integer parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<uuid::Error> for CopyDbError {
    #[track_caller]
    fn from(err: uuid::Error) -> CopyDbError {
        let detail = err.to_string();
        CopyDbError::from_components(
            ErrorKind::InvalidData,
            Cow::Borrowed("UUID parsing failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps catalog store errors.
///
/// Busy and locked conditions map to [`ErrorKind::CatalogBusy`] so callers can tell contention
/// apart from genuine query failures; the retry layer only ever surfaces them once the budget
/// is exhausted.
impl From<sqlx::Error> for CopyDbError {
    #[track_caller]
    fn from(err: sqlx::Error) -> CopyDbError {
        let kind = match &err {
            sqlx::Error::Database(_) if crate::catalog::retry::is_busy(&err) => {
                ErrorKind::CatalogBusy
            }
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed => ErrorKind::CatalogNotOpen,
            _ => ErrorKind::CatalogQueryFailed,
        };

        let detail = err.to_string();
        CopyDbError::from_components(
            kind,
            Cow::Borrowed("Catalog operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps Postgres client errors, classifying SQLSTATE class 08 as connection failures.
///
/// The conversion assumes the source server; target-side callers re-classify through
/// [`crate::clients::postgres::target_error`].
impl From<tokio_postgres::Error> for CopyDbError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> CopyDbError {
        let is_connection = err.is_closed()
            || err
                .code()
                .is_some_and(|code| code.code().starts_with("08"));

        let (kind, description) = if is_connection {
            (ErrorKind::SourceConnectionFailed, "Postgres connection failed")
        } else {
            (ErrorKind::SourceQueryFailed, "Postgres query failed")
        };

        let detail = match err.as_db_error() {
            Some(db_error) => format!("{}: {}", db_error.code().code(), db_error.message()),
            None => err.to_string(),
        };

        CopyDbError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copydb_error;

    #[test]
    fn single_error_exposes_kind_and_detail() {
        let err = copydb_error!(
            ErrorKind::ConfigMismatch,
            "Source URI mismatch",
            "catalog: a, run: b"
        );

        assert_eq!(err.kind(), ErrorKind::ConfigMismatch);
        assert_eq!(err.detail(), Some("catalog: a, run: b"));
        assert!(err.errors().is_none());
        assert!(err.to_string().starts_with("[ConfigMismatch] Source URI mismatch @"));
    }

    #[test]
    fn vec_of_one_error_is_unwrapped() {
        let err: CopyDbError = vec![copydb_error!(ErrorKind::QueueClosed, "Queue closed")].into();
        assert!(err.errors().is_none());
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
    }

    #[test]
    fn aggregated_errors_flatten_kinds() {
        let err: CopyDbError = vec![
            copydb_error!(ErrorKind::WorkUnitFailed, "Copy failed"),
            vec![
                copydb_error!(ErrorKind::TargetQueryFailed, "Index failed"),
                copydb_error!(ErrorKind::IoError, "Marker failed"),
            ]
            .into(),
        ]
        .into();

        assert_eq!(
            err.kinds(),
            vec![
                ErrorKind::WorkUnitFailed,
                ErrorKind::TargetQueryFailed,
                ErrorKind::IoError
            ]
        );
        assert_eq!(err.errors().map(<[_]>::len), Some(2));
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn connection_failures_are_classified() {
        let err = copydb_error!(ErrorKind::SourceConnectionFailed, "Connection reset");
        assert!(err.is_connection_failure());

        let err = copydb_error!(ErrorKind::TargetQueryFailed, "Unique violation");
        assert!(!err.is_connection_failure());

        let err: CopyDbError = vec![
            copydb_error!(ErrorKind::SourceConnectionFailed, "Connection reset"),
            copydb_error!(ErrorKind::TargetQueryFailed, "Unique violation"),
        ]
        .into();
        assert!(!err.is_connection_failure());
    }
}
