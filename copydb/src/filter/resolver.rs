use chrono::Utc;
use copydb_config::shared::{FilterConfig, FilterType};
use tracing::{error, info};

use crate::catalog::{Catalog, Catalogs, FilterEntry, FilterOptions, Section};
use crate::error::CopyDbResult;
use crate::types::Oid;

/// Prepares the exclusion index of the filter catalog.
///
/// Returns the number of filter entries, zero without touching the catalogs when nothing is
/// filtered. A failure leaves the `filters` section unfetched, so the entries are never used.
pub async fn resolve_filters(
    catalogs: &Catalogs,
    filters: &FilterConfig,
    options: FilterOptions,
) -> CopyDbResult<u64> {
    if filters.filter_type() == FilterType::None
        && !options.skip_extensions
        && !options.skip_collations
    {
        info!("no filter configured");
        return Ok(0);
    }

    if catalogs.filter.section(Section::Filters).await?.fetched {
        let entries = catalogs.filter.count_filters().await?;
        info!(entries, "filters already prepared");
        return Ok(entries);
    }

    let start = Utc::now();
    let entries = match catalogs.filter.prepare_filter(&catalogs.source, options).await {
        Ok(entries) => entries,
        Err(err) => {
            error!(error = %err, "failed to prepare the filters");
            return Err(err);
        }
    };

    catalogs
        .filter
        .mark_section_fetched(Section::Filters, start, Utc::now())
        .await?;

    info!(entries, filter_type = ?filters.filter_type(), "prepared filters");

    Ok(entries)
}

/// The filter entry excluding an object, looked up by oid first and by restore-list name next.
pub async fn lookup_exclusion(
    filter: &Catalog,
    oid: Oid,
    restore_list_name: Option<&str>,
) -> CopyDbResult<Option<FilterEntry>> {
    if oid.is_valid() {
        if let Some(entry) = filter.lookup_filter_by_oid(oid).await? {
            return Ok(Some(entry));
        }
    }

    match restore_list_name {
        Some(name) if !name.is_empty() => filter.lookup_filter_by_restore_list_name(name).await,
        _ => Ok(None),
    }
}
