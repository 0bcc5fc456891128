//! JSON marker files of the claim protocol.
//!
//! Markers are written to a temporary sibling and then renamed or linked into place, so a
//! reader never sees a partial marker. Claim markers are linked exclusively: two claimants
//! racing on the same unit cannot both create one.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::bail;
use crate::coordination::unit::WorkUnit;
use crate::error::{CopyDbResult, ErrorKind};
use crate::types::Claimant;

/// Content of the claim marker of a unit being worked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMarker {
    pub claimant: Claimant,
    pub unit: WorkUnit,
    pub command: String,
    pub start_time_epoch: i64,
}

/// Content of the done marker of a finished unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub claimant: Claimant,
    pub unit: WorkUnit,
    pub start_time_epoch: i64,
    pub done_time_epoch: i64,
    /// Milliseconds.
    pub duration: i64,
    pub bytes: u64,
}

/// Content of a phase done marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMarker {
    pub done_time_epoch: i64,
    pub units: u64,
}

/// Reads the marker at `path`, `None` when it does not exist.
pub async fn read_marker<T: DeserializeOwned>(path: &Path) -> CopyDbResult<Option<T>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    match serde_json::from_slice(&content) {
        Ok(marker) => Ok(Some(marker)),
        Err(err) => bail!(
            ErrorKind::InvalidMarker,
            "Marker file is not valid",
            detail = format!("path: {}, error: {err}", path.display()),
            source: err
        ),
    }
}

pub async fn marker_exists(path: &Path) -> CopyDbResult<bool> {
    Ok(tokio::fs::try_exists(path).await?)
}

/// Writes `marker` at `path`, replacing any previous marker.
pub async fn write_marker<T: Serialize>(path: &Path, marker: &T) -> CopyDbResult<()> {
    let tmp = write_temp_sibling(path, marker).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        remove_marker(&tmp).await?;
        return Err(err.into());
    }

    Ok(())
}

/// Creates the marker at `path`; returns `false` when it already exists.
///
/// The content is complete on disk before the marker appears under `path`.
pub async fn create_marker<T: Serialize>(path: &Path, marker: &T) -> CopyDbResult<bool> {
    let tmp = write_temp_sibling(path, marker).await?;
    let linked = tokio::fs::hard_link(&tmp, path).await;
    remove_marker(&tmp).await?;

    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == IoErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Writes and syncs `marker` in a sibling of `path` private to this writer.
async fn write_temp_sibling<T: Serialize>(path: &Path, marker: &T) -> CopyDbResult<PathBuf> {
    let content = serde_json::to_vec_pretty(marker)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;

    Ok(tmp)
}

/// Removes the marker at `path`; a missing marker is not an error.
pub async fn remove_marker(path: &Path) -> CopyDbResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Oid;

    fn claim() -> ClaimMarker {
        ClaimMarker {
            claimant: Claimant::current(),
            unit: WorkUnit::whole_table(Oid(10)),
            command: "COPY public.t".to_string(),
            start_time_epoch: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn claim_markers_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10");

        assert!(create_marker(&path, &claim()).await.unwrap());
        assert!(!create_marker(&path, &claim()).await.unwrap());

        let marker: ClaimMarker = read_marker(&path).await.unwrap().unwrap();
        assert_eq!(marker.unit, WorkUnit::whole_table(Oid(10)));

        remove_marker(&path).await.unwrap();
        remove_marker(&path).await.unwrap();
        assert!(read_marker::<ClaimMarker>(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_markers_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10.done");
        tokio::fs::write(&path, "{").await.unwrap();

        let err = read_marker::<DoneMarker>(&path).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMarker);

        write_marker(
            &path,
            &PhaseMarker {
                done_time_epoch: 1,
                units: 2,
            },
        )
        .await
        .unwrap();
        assert!(marker_exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn created_markers_leave_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10");

        assert!(create_marker(&path, &claim()).await.unwrap());
        assert!(!create_marker(&path, &claim()).await.unwrap());
        write_marker(&dir.path().join("10.done"), &claim()).await.unwrap();

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["10".to_string(), "10.done".to_string()]);
    }
}
