//! Mapping between source positions and the target positions they were applied at.

use serde::Serialize;
use sqlx::Row;

use crate::catalog::sql::Statement;
use crate::catalog::store::Catalog;
use crate::error::CopyDbResult;
use crate::types::{PgLsn, parse_lsn};

/// A source commit position and the target insert position it was applied at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LsnTrackingPoint {
    #[serde(serialize_with = "serialize_lsn")]
    pub source: PgLsn,
    #[serde(serialize_with = "serialize_lsn")]
    pub target: PgLsn,
}

fn serialize_lsn<S: serde::Serializer>(lsn: &PgLsn, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(lsn)
}

impl Catalog {
    /// Replaces the stored tracking points with `points`.
    pub async fn save_lsn_tracking(&self, points: &[LsnTrackingPoint]) -> CopyDbResult<()> {
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| b.source.cmp(&a.source));

        let _permit = self.lock().await?;
        let mut tx = self.begin().await?;

        let conn = tx.conn()?;
        if let Err(err) = sqlx::query(Statement::LsnTrackingDeleteAll.sql())
            .execute(&mut *conn)
            .await
        {
            return Err(tx.statement_error(Statement::LsnTrackingDeleteAll, err));
        }

        for point in &sorted {
            let conn = tx.conn()?;
            let result = sqlx::query(Statement::LsnTrackingInsert.sql())
                .bind(point.source.to_string())
                .bind(point.target.to_string())
                .execute(conn)
                .await;

            if let Err(err) = result {
                return Err(tx.statement_error(Statement::LsnTrackingInsert, err));
            }
        }

        tx.commit().await
    }

    /// Stored tracking points, newest source position first.
    pub async fn lsn_tracking(&self) -> CopyDbResult<Vec<LsnTrackingPoint>> {
        let rows = self
            .run(Statement::LsnTrackingSelectAll, |pool| async move {
                sqlx::query(Statement::LsnTrackingSelectAll.sql())
                    .fetch_all(&pool)
                    .await
            })
            .await?;

        // Positions are stored as text, which does not sort numerically.
        let mut points = rows
            .iter()
            .map(|row| {
                Ok(LsnTrackingPoint {
                    source: parse_lsn(row.get("source"))?,
                    target: parse_lsn(row.get("target"))?,
                })
            })
            .collect::<CopyDbResult<Vec<_>>>()?;
        points.sort_by(|a, b| b.source.cmp(&a.source));

        Ok(points)
    }
}

/// The source position made durable once the target flushed up to `target_flush`.
///
/// `points` must be sorted by source position, newest first.
pub fn durable_lsn(points: &[LsnTrackingPoint], target_flush: PgLsn) -> Option<PgLsn> {
    points
        .iter()
        .find(|point| point.target <= target_flush)
        .map(|point| point.source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::CatalogRole;

    fn point(source: &str, target: &str) -> LsnTrackingPoint {
        LsnTrackingPoint {
            source: parse_lsn(source).unwrap(),
            target: parse_lsn(target).unwrap(),
        }
    }

    #[test]
    fn durable_position_is_the_newest_flushed_point() {
        let points = [
            point("0/A000", "1/3000"),
            point("0/9000", "1/2000"),
            point("0/8000", "1/1000"),
        ];

        assert_eq!(
            durable_lsn(&points, parse_lsn("1/2800").unwrap()),
            Some(parse_lsn("0/9000").unwrap())
        );
        assert_eq!(durable_lsn(&points, parse_lsn("1/0").unwrap()), None);
    }

    #[tokio::test]
    async fn tracking_is_rewritten_wholesale_and_sorted_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(CatalogRole::Source, dir.path().join("source.db"));
        catalog.init().await.unwrap();

        catalog
            .save_lsn_tracking(&[point("0/1", "0/1")])
            .await
            .unwrap();
        catalog
            .save_lsn_tracking(&[point("0/9", "0/2"), point("0/10", "0/3")])
            .await
            .unwrap();

        let points = catalog.lsn_tracking().await.unwrap();
        assert_eq!(points, vec![point("0/10", "0/3"), point("0/9", "0/2")]);
    }
}
