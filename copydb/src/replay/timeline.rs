use tracing::info;

use crate::catalog::{Catalog, TimelineHistoryEntry, parse_timeline_history};
use crate::coordination::CdcPaths;
use crate::copydb_error;
use crate::error::{CopyDbResult, ErrorKind};

/// Loads the timeline files of the CDC directory into the catalog.
///
/// The history file is absent while the source is still on its first timeline.
pub async fn load_timeline_history(
    catalog: &Catalog,
    cdc: &CdcPaths,
) -> CopyDbResult<Vec<TimelineHistoryEntry>> {
    let tli = tokio::fs::read_to_string(&cdc.tli).await?;
    let tli = tli.trim().parse::<u32>().map_err(|err| {
        copydb_error!(
            ErrorKind::InvalidData,
            "Malformed timeline file",
            detail = format!("path: {}, content: {tli:?}", cdc.tli.display()),
            source: err
        )
    })?;

    let history = match tokio::fs::try_exists(&cdc.tli_history).await? {
        true => tokio::fs::read_to_string(&cdc.tli_history).await?,
        false => String::new(),
    };

    let entries = parse_timeline_history(&history, tli)?;
    catalog.add_timeline_history(&entries).await?;

    info!(tli, entries = entries.len(), "loaded timeline history");

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogRole;
    use crate::types::parse_lsn;

    #[tokio::test]
    async fn history_files_are_stored_in_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let cdc = CdcPaths::new(dir.path().join("cdc"));
        tokio::fs::create_dir_all(&cdc.dir).await.unwrap();
        tokio::fs::write(&cdc.tli, "3\n").await.unwrap();
        tokio::fs::write(
            &cdc.tli_history,
            "1\t0/3000000\tno recovery target specified\n2\t0/5000000\tno recovery target specified\n",
        )
        .await
        .unwrap();

        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let entries = load_timeline_history(&catalog, &cdc).await.unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].tli, 3);
        assert_eq!(entries[2].startpos, parse_lsn("0/5000000").unwrap());
        assert_eq!(catalog.timeline_history().await.unwrap(), entries);
    }

    #[tokio::test]
    async fn first_timeline_has_no_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let cdc = CdcPaths::new(dir.path());
        tokio::fs::write(&cdc.tli, "1").await.unwrap();

        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let entries = load_timeline_history(&catalog, &cdc).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tli, 1);
    }
}
