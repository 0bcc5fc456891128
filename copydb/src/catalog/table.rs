//! Tables, their attributes, split parts, sizes and checksums.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::CopyDbResult;
use crate::progress::pretty_bytes;
use crate::types::Oid;

/// A table of the source database.
///
/// Lookups by oid or name load [`SourceTable::attributes`] and [`SourceTable::parts`];
/// iterations leave them empty and only fill [`SourceTable::partcount`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    pub oid: Oid,
    pub datname: Option<String>,
    /// Quoted `schema.name`.
    pub qname: String,
    pub nspname: String,
    pub relname: String,
    pub amname: Option<String>,
    pub restore_list_name: String,
    pub relpages: i64,
    pub reltuples: i64,
    pub bytes: u64,
    pub exclude_data: bool,
    /// Integer column used to split the table into ranges.
    pub part_key: Option<String>,
    pub partcount: u32,
    pub attributes: Vec<TableAttribute>,
    pub parts: Vec<TablePart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableAttribute {
    pub attnum: i32,
    pub atttypid: Oid,
    pub attname: String,
    pub attisprimary: bool,
    pub attisgenerated: bool,
}

/// One range of a split table.
///
/// `min` and `max` are inclusive; the first part has no lower bound and the last part no
/// upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePart {
    /// Starts at 1.
    pub partnum: u32,
    pub partcount: u32,
    pub min: Option<i64>,
    pub max: Option<i64>,
    /// Estimated rows.
    pub count: i64,
}

impl TablePart {
    /// Row filter selecting this part, for `COPY (select ... where ...)`.
    pub fn predicate(&self, column: &str) -> String {
        let column = pg_escape::quote_identifier(column);

        match (self.min, self.max) {
            (Some(min), Some(max)) => format!("{column} between {min} and {max}"),
            (Some(min), None) => format!("{column} >= {min}"),
            (None, Some(max)) => format!("{column} <= {max}"),
            (None, None) => "true".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChecksum {
    pub rowcount: i64,
    pub checksum: String,
}

/// Source and target checksums of one table, recorded by compare.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChecksums {
    pub source: Option<TableChecksum>,
    pub target: Option<TableChecksum>,
}

/// Splits a table of `bytes` bytes whose part key spans `min..=max`.
///
/// Returns no part when the table is below `threshold` or too small to split. A `max_parts`
/// of zero leaves the part count unbounded.
pub fn split_parts(
    bytes: u64,
    threshold: u64,
    max_parts: u32,
    min: i64,
    max: i64,
    rows: i64,
) -> Vec<TablePart> {
    if threshold == 0 || bytes < threshold || max < min {
        return Vec::new();
    }

    let mut count = bytes.div_ceil(threshold);
    if max_parts > 0 {
        count = count.min(u64::from(max_parts));
    }

    // At least one key per part.
    let range = (max as i128 - min as i128 + 1) as u128;
    let count = (count as u128).min(range) as u64;
    if count < 2 {
        return Vec::new();
    }

    let step = range.div_ceil(count as u128) as i128;
    let partcount = count as u32;
    let part_rows = rows.max(0) / count as i64;

    (0..partcount)
        .map(|index| {
            let lower = min as i128 + step * index as i128;
            let upper = (lower + step - 1).min(max as i128);

            TablePart {
                partnum: index + 1,
                partcount,
                min: (index > 0).then_some(lower as i64),
                max: (index + 1 < partcount).then_some(upper as i64),
                count: part_rows,
            }
        })
        .collect()
}

impl Catalog {
    /// Adds a table with its size, attributes and parts.
    pub async fn add_table(&self, table: &SourceTable) -> CopyDbResult<()> {
        self.run(Statement::TableInsert, |pool| async move {
            sqlx::query(Statement::TableInsert.sql())
                .bind(table.oid)
                .bind(table.datname.as_deref())
                .bind(&table.qname)
                .bind(&table.nspname)
                .bind(&table.relname)
                .bind(table.amname.as_deref())
                .bind(&table.restore_list_name)
                .bind(table.relpages)
                .bind(table.reltuples)
                .bind(table.exclude_data)
                .bind(table.part_key.as_deref())
                .execute(&pool)
                .await
        })
        .await?;

        self.add_table_size(table.oid, table.bytes).await?;
        self.add_attributes(table.oid, &table.attributes).await?;

        for part in &table.parts {
            self.add_table_part(table.oid, part).await?;
        }

        Ok(())
    }

    pub async fn add_table_size(&self, oid: Oid, bytes: u64) -> CopyDbResult<()> {
        let bytes_pretty = pretty_bytes(bytes);
        let bytes_pretty = bytes_pretty.as_str();

        self.run(Statement::TableSizeInsert, |pool| async move {
            sqlx::query(Statement::TableSizeInsert.sql())
                .bind(oid)
                .bind(bytes as i64)
                .bind(bytes_pretty)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn add_attributes(
        &self,
        oid: Oid,
        attributes: &[TableAttribute],
    ) -> CopyDbResult<()> {
        for attribute in attributes {
            self.run(Statement::AttributeInsert, |pool| async move {
                sqlx::query(Statement::AttributeInsert.sql())
                    .bind(oid)
                    .bind(attribute.attnum)
                    .bind(attribute.atttypid)
                    .bind(&attribute.attname)
                    .bind(attribute.attisprimary)
                    .bind(attribute.attisgenerated)
                    .execute(&pool)
                    .await
            })
            .await?;
        }

        Ok(())
    }

    pub async fn add_table_part(&self, oid: Oid, part: &TablePart) -> CopyDbResult<()> {
        self.run(Statement::TablePartInsert, |pool| async move {
            sqlx::query(Statement::TablePartInsert.sql())
                .bind(oid)
                .bind(part.partnum)
                .bind(part.partcount)
                .bind(part.min)
                .bind(part.max)
                .bind(part.count)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn set_table_exclude_data(&self, oid: Oid, exclude_data: bool) -> CopyDbResult<()> {
        self.run(Statement::TableSetExcludeData, |pool| async move {
            sqlx::query(Statement::TableSetExcludeData.sql())
                .bind(exclude_data)
                .bind(oid)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    pub async fn lookup_table_by_oid(&self, oid: Oid) -> CopyDbResult<Option<SourceTable>> {
        let row = self
            .run_locked(Statement::TableSelectByOid, |pool| async move {
                sqlx::query(Statement::TableSelectByOid.sql())
                    .bind(oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        self.with_details(row).await
    }

    /// Looks up a table and the part numbered `partnum`.
    pub async fn lookup_table_part(
        &self,
        oid: Oid,
        partnum: u32,
    ) -> CopyDbResult<Option<(SourceTable, TablePart)>> {
        let Some(table) = self.lookup_table_by_oid(oid).await? else {
            return Ok(None);
        };

        let part = table.parts.iter().find(|part| part.partnum == partnum).copied();

        Ok(part.map(|part| (table, part)))
    }

    pub async fn lookup_table_by_name(
        &self,
        nspname: &str,
        relname: &str,
    ) -> CopyDbResult<Option<SourceTable>> {
        let row = self
            .run_locked(Statement::TableSelectByName, |pool| async move {
                sqlx::query(Statement::TableSelectByName.sql())
                    .bind(nspname)
                    .bind(relname)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        self.with_details(row).await
    }

    /// Every table, largest first.
    pub async fn tables(&self) -> CopyDbResult<Vec<SourceTable>> {
        self.select_tables(Statement::TableSelectAll).await
    }

    pub async fn tables_without_primary_key(&self) -> CopyDbResult<Vec<SourceTable>> {
        self.select_tables(Statement::TableSelectWithoutPrimaryKey)
            .await
    }

    pub async fn tables_with_generated_columns(&self) -> CopyDbResult<Vec<SourceTable>> {
        self.select_tables(Statement::TableSelectWithGeneratedColumns)
            .await
    }

    /// Tables with a COPY currently running: an unfinished summary row whose worker is still
    /// registered in the process table.
    pub async fn tables_in_copy(&self) -> CopyDbResult<Vec<SourceTable>> {
        self.select_tables(Statement::TableSelectInCopy).await
    }

    pub async fn count_tables(&self) -> CopyDbResult<u64> {
        let count: i64 = self
            .run(Statement::TableCount, |pool| async move {
                sqlx::query_scalar(Statement::TableCount.sql())
                    .fetch_one(&pool)
                    .await
            })
            .await?;

        Ok(count as u64)
    }

    pub async fn table_attributes(&self, oid: Oid) -> CopyDbResult<Vec<TableAttribute>> {
        let rows = self
            .run(Statement::AttributeSelect, |pool| async move {
                sqlx::query(Statement::AttributeSelect.sql())
                    .bind(oid)
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| TableAttribute {
                attnum: row.get("attnum"),
                atttypid: row.get("attypid"),
                attname: row.get("attname"),
                attisprimary: row.get("attisprimary"),
                attisgenerated: row.get("attisgenerated"),
            })
            .collect())
    }

    pub async fn table_parts(&self, oid: Oid) -> CopyDbResult<Vec<TablePart>> {
        let rows = self
            .run(Statement::TablePartSelect, |pool| async move {
                sqlx::query(Statement::TablePartSelect.sql())
                    .bind(oid)
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        Ok(rows
            .iter()
            .map(|row| TablePart {
                partnum: row.get("partnum"),
                partcount: row.get("partcount"),
                min: row.get("min"),
                max: row.get("max"),
                count: row.get("count"),
            })
            .collect())
    }

    pub async fn add_source_checksum(
        &self,
        oid: Oid,
        checksum: &TableChecksum,
    ) -> CopyDbResult<()> {
        self.upsert_checksum(Statement::ChecksumUpsertSource, oid, checksum)
            .await
    }

    pub async fn add_target_checksum(
        &self,
        oid: Oid,
        checksum: &TableChecksum,
    ) -> CopyDbResult<()> {
        self.upsert_checksum(Statement::ChecksumUpsertTarget, oid, checksum)
            .await
    }

    pub async fn lookup_checksums(&self, oid: Oid) -> CopyDbResult<TableChecksums> {
        let row = self
            .run_locked(Statement::ChecksumSelect, |pool| async move {
                sqlx::query(Statement::ChecksumSelect.sql())
                    .bind(oid)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        let Some(row) = row else {
            return Ok(TableChecksums::default());
        };

        let side = |rowcount: &str, sum: &str| {
            let rowcount: Option<i64> = row.get(rowcount);
            let checksum: Option<String> = row.get(sum);

            rowcount
                .zip(checksum)
                .map(|(rowcount, checksum)| TableChecksum { rowcount, checksum })
        };

        Ok(TableChecksums {
            source: side("srcrowcount", "srcsum"),
            target: side("dstrowcount", "dstsum"),
        })
    }

    async fn upsert_checksum(
        &self,
        statement: Statement,
        oid: Oid,
        checksum: &TableChecksum,
    ) -> CopyDbResult<()> {
        self.run_locked(statement, |pool| async move {
            sqlx::query(statement.sql())
                .bind(oid)
                .bind(checksum.rowcount)
                .bind(&checksum.checksum)
                .execute(&pool)
                .await
        })
        .await?;

        Ok(())
    }

    async fn select_tables(&self, statement: Statement) -> CopyDbResult<Vec<SourceTable>> {
        let rows = self
            .run(statement, |pool| async move {
                sqlx::query(statement.sql()).fetch_all(&pool).await
            })
            .await?;

        Ok(rows.iter().map(table_from_row).collect())
    }

    async fn with_details(&self, row: Option<SqliteRow>) -> CopyDbResult<Option<SourceTable>> {
        let Some(row) = row else {
            return Ok(None);
        };

        let mut table = table_from_row(&row);
        table.attributes = self.table_attributes(table.oid).await?;
        table.parts = self.table_parts(table.oid).await?;

        Ok(Some(table))
    }
}

fn table_from_row(row: &SqliteRow) -> SourceTable {
    SourceTable {
        oid: row.get("oid"),
        datname: row.get("datname"),
        qname: row.get("qname"),
        nspname: row.get("nspname"),
        relname: row.get("relname"),
        amname: row.get("amname"),
        restore_list_name: row.get("restore_list_name"),
        relpages: row.get("relpages"),
        reltuples: row.get("reltuples"),
        bytes: row.get::<i64, _>("bytes") as u64,
        exclude_data: row.get("exclude_data"),
        part_key: row.get("part_key"),
        partcount: row.get::<i64, _>("partcount") as u32,
        attributes: Vec::new(),
        parts: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;

    fn table(oid: u32, relname: &str, bytes: u64) -> SourceTable {
        SourceTable {
            oid: Oid(oid),
            datname: Some("app".to_string()),
            qname: format!("public.{relname}"),
            nspname: "public".to_string(),
            relname: relname.to_string(),
            amname: Some("heap".to_string()),
            restore_list_name: format!("public {relname} postgres"),
            relpages: 10,
            reltuples: 1_000,
            bytes,
            exclude_data: false,
            part_key: None,
            partcount: 0,
            attributes: Vec::new(),
            parts: Vec::new(),
        }
    }

    #[test]
    fn small_tables_are_not_split() {
        assert!(split_parts(100, 1_000, 4, 1, 10_000, 0).is_empty());
        assert!(split_parts(100, 0, 4, 1, 10_000, 0).is_empty());
    }

    #[test]
    fn parts_cover_the_key_range_contiguously() {
        let parts = split_parts(10_000, 1_000, 4, 1, 1_000, 1_000);

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].min, None);
        assert_eq!(parts[0].max, Some(250));
        assert_eq!(parts[1].min, Some(251));
        assert_eq!(parts[2].max, Some(750));
        assert_eq!(parts[3].min, Some(751));
        assert_eq!(parts[3].max, None);
        assert!(parts.iter().all(|part| part.partcount == 4 && part.count == 250));
        assert_eq!(
            parts.iter().map(|part| part.partnum).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn parts_never_outnumber_keys() {
        let parts = split_parts(1 << 30, 1, 0, 5, 7, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].min, Some(6));
        assert_eq!(parts[1].max, Some(6));
    }

    #[test]
    fn part_predicates_quote_the_key() {
        let part = TablePart {
            partnum: 2,
            partcount: 3,
            min: Some(10),
            max: Some(19),
            count: 0,
        };
        assert_eq!(part.predicate("id"), "id between 10 and 19");
        assert_eq!(part.predicate("Id"), "\"Id\" between 10 and 19");
    }

    #[tokio::test]
    async fn tables_are_found_by_oid_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let mut users = table(16_384, "users", 8_192);
        users.part_key = Some("id".to_string());
        users.attributes = vec![TableAttribute {
            attnum: 1,
            atttypid: Oid(23),
            attname: "id".to_string(),
            attisprimary: true,
            attisgenerated: false,
        }];
        users.parts = split_parts(8_192, 4_096, 2, 1, 100, 1_000);
        catalog.add_table(&users).await.unwrap();
        catalog.add_table(&table(16_390, "events", 1 << 20)).await.unwrap();

        let found = catalog.lookup_table_by_oid(Oid(16_384)).await.unwrap().unwrap();
        assert_eq!(found.partcount, 2);
        assert_eq!(found.attributes, users.attributes);
        assert_eq!(found.parts, users.parts);

        let found = catalog
            .lookup_table_by_name("public", "events")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.oid, Oid(16_390));

        let (_, part) = catalog
            .lookup_table_part(Oid(16_384), 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(part.max, None);

        let tables = catalog.tables().await.unwrap();
        assert_eq!(
            tables.iter().map(|table| table.oid).collect::<Vec<_>>(),
            vec![Oid(16_390), Oid(16_384)]
        );

        let without_pk = catalog.tables_without_primary_key().await.unwrap();
        assert_eq!(without_pk.len(), 1);
        assert_eq!(without_pk[0].oid, Oid(16_390));
        assert_eq!(catalog.count_tables().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn checksums_accumulate_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        let checksum = TableChecksum {
            rowcount: 42,
            checksum: "6f1ed002ab5595859014ebf0951522d9".to_string(),
        };
        catalog
            .add_source_checksum(Oid(1), &checksum)
            .await
            .unwrap();

        let checksums = catalog.lookup_checksums(Oid(1)).await.unwrap();
        assert_eq!(checksums.source, Some(checksum.clone()));
        assert_eq!(checksums.target, None);

        catalog
            .add_target_checksum(Oid(1), &checksum)
            .await
            .unwrap();
        let checksums = catalog.lookup_checksums(Oid(1)).await.unwrap();
        assert_eq!(checksums.target, Some(checksum));
    }
}
