//! The setup record: what a run's catalogs were created for.
//!
//! Once written, later runs against the same catalog files must agree with it. A disagreement
//! is never resolved automatically; the operator has to restart the run from scratch.

use sqlx::Row;
use tracing::{error, info};

use crate::catalog::section::Section;
use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::copydb_error;
use crate::error::{CopyDbError, CopyDbResult, ErrorKind};

/// Singleton record describing the run a catalog set belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupRecord {
    /// Source connection identity, without password.
    pub source_pg_uri: Option<String>,
    /// Target connection identity, without password.
    pub target_pg_uri: Option<String>,
    pub snapshot: Option<String>,
    pub split_tables_larger_than: Option<u64>,
    pub split_max_parts: Option<u32>,
    /// Serialized filter configuration, compared byte-for-byte.
    pub filters: Option<String>,
    pub plugin: Option<String>,
    pub slot_name: Option<String>,
}

/// Which optional fields a registration compares against an existing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupCheck {
    /// Compare snapshots; relaxed unless the run copies from a consistent snapshot.
    pub snapshot: bool,
    /// Compare split parameters; they only matter once table parts were computed.
    pub split: bool,
}

impl Catalog {
    /// Returns the setup record, or `None` when the catalog was never configured.
    pub async fn fetch_setup(&self) -> CopyDbResult<Option<SetupRecord>> {
        let row = self
            .run(Statement::SetupSelect, |pool| async move {
                sqlx::query(Statement::SetupSelect.sql())
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.map(|row| SetupRecord {
            source_pg_uri: row.get("source_pg_uri"),
            target_pg_uri: row.get("target_pg_uri"),
            snapshot: row.get("snapshot"),
            split_tables_larger_than: row
                .get::<Option<i64>, _>("split_tables_larger_than")
                .map(|value| value as u64),
            split_max_parts: row
                .get::<Option<i64>, _>("split_max_parts")
                .map(|value| value as u32),
            filters: row.get("filters"),
            plugin: row.get("plugin"),
            slot_name: row.get("slot_name"),
        }))
    }

    /// Records `setup`, or checks it against the record of a previous run.
    ///
    /// Fails with [`ErrorKind::ConfigMismatch`] carrying both values when the previous record
    /// disagrees.
    pub async fn register_setup(&self, setup: &SetupRecord, check: SetupCheck) -> CopyDbResult<()> {
        let _permit = self.lock().await?;

        let Some(existing) = self.fetch_setup().await? else {
            self.insert_setup(setup).await?;
            info!(catalog = %self.role(), "registered run setup");
            return Ok(());
        };

        compare("source connection", &existing.source_pg_uri, &setup.source_pg_uri)?;

        if existing.target_pg_uri.is_some() && setup.target_pg_uri.is_some() {
            compare("target connection", &existing.target_pg_uri, &setup.target_pg_uri)?;
        }

        if check.snapshot {
            compare("snapshot", &existing.snapshot, &setup.snapshot)?;
        }

        if check.split && self.section(Section::TableDataParts).await?.fetched {
            compare(
                "split tables larger than",
                &existing.split_tables_larger_than,
                &setup.split_tables_larger_than,
            )?;
            compare(
                "split max parts",
                &existing.split_max_parts,
                &setup.split_max_parts,
            )?;
        }

        compare("filters", &existing.filters, &setup.filters)?;

        Ok(())
    }

    /// Records the exported snapshot of the current run.
    pub async fn update_setup_snapshot(&self, snapshot: &str) -> CopyDbResult<()> {
        self.run_locked(Statement::SetupUpdateSnapshot, |pool| async move {
            sqlx::query(Statement::SetupUpdateSnapshot.sql())
                .bind(snapshot)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    /// Records the logical decoding plugin and slot of the replay phase.
    pub async fn update_setup_replication(
        &self,
        plugin: &str,
        slot_name: &str,
    ) -> CopyDbResult<()> {
        self.run_locked(Statement::SetupUpdateReplication, |pool| async move {
            sqlx::query(Statement::SetupUpdateReplication.sql())
                .bind(plugin)
                .bind(slot_name)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    async fn insert_setup(&self, setup: &SetupRecord) -> CopyDbResult<()> {
        self.run(Statement::SetupInsert, |pool| async move {
            sqlx::query(Statement::SetupInsert.sql())
                .bind(setup.source_pg_uri.as_deref())
                .bind(setup.target_pg_uri.as_deref())
                .bind(setup.snapshot.as_deref())
                .bind(setup.split_tables_larger_than.map(|value| value as i64))
                .bind(setup.split_max_parts.map(i64::from))
                .bind(setup.filters.as_deref())
                .bind(setup.plugin.as_deref())
                .bind(setup.slot_name.as_deref())
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }
}

fn compare<T>(field: &'static str, catalog: &Option<T>, run: &Option<T>) -> CopyDbResult<()>
where
    T: PartialEq + std::fmt::Debug,
{
    if catalog == run {
        return Ok(());
    }

    error!(
        field,
        catalog = ?catalog,
        run = ?run,
        "run setup does not match the catalog, restart the run to discard the catalogs"
    );

    Err(mismatch(field, catalog, run))
}

fn mismatch<T: std::fmt::Debug>(
    field: &'static str,
    catalog: &Option<T>,
    run: &Option<T>,
) -> CopyDbError {
    copydb_error!(
        ErrorKind::ConfigMismatch,
        "Run setup does not match the catalog",
        detail = format!("field: {field}, catalog: {catalog:?}, run: {run:?}")
    )
}
