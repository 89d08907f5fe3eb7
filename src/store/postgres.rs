use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};

use super::{
    row_timestamp, telemetry_row, within_window, Coalesced, Fields, Row, RowStore, StoreError,
    Table, DEVICE_COLUMN, TIMESTAMP_COLUMN,
};

/// Rows of every logical table share one Postgres table, `sheet_rows`,
/// ordered by `position`. Key lookups compare JSON values, so `"1"` and `1`
/// are different keys.
#[derive(Clone)]
pub struct PgRowStore {
    pool: PgPool,
}

type RowRecord = (i64, Json<Fields>);

fn into_row((version, Json(fields)): RowRecord) -> Row {
    Row {
        version: version as u64,
        fields,
    }
}

impl PgRowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl RowStore for PgRowStore {
    async fn list_all(&self, table: Table) -> Result<Vec<Row>, StoreError> {
        let rows: Vec<RowRecord> = sqlx::query_as(
            r#"
            SELECT version, fields
            FROM sheet_rows
            WHERE table_name = $1
            ORDER BY position ASC
            "#,
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(into_row).collect())
    }

    async fn append(&self, table: Table, fields: Fields) -> Result<Row, StoreError> {
        let row: RowRecord = sqlx::query_as(
            r#"
            INSERT INTO sheet_rows (table_name, version, fields)
            VALUES ($1, 1, $2)
            RETURNING version, fields
            "#,
        )
        .bind(table.as_str())
        .bind(Json(&fields))
        .fetch_one(&self.pool)
        .await?;

        Ok(into_row(row))
    }

    async fn update_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
        updates: Fields,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError> {
        let mut tx = self.pool.begin().await?;

        let found: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT position, version
            FROM sheet_rows
            WHERE table_name = $1 AND fields -> $2 = $3
            ORDER BY position ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(table.as_str())
        .bind(key_column)
        .bind(Json(key_value))
        .fetch_optional(&mut *tx)
        .await?;

        let (position, version) = found.ok_or_else(|| StoreError::NotFound {
            table,
            column: key_column.to_owned(),
            value: key_value.clone(),
        })?;

        if let Some(expected) = expected_version {
            if version as u64 != expected {
                return Err(StoreError::StaleVersion {
                    table,
                    expected,
                    found: version as u64,
                });
            }
        }

        // `||` on jsonb is a shallow merge: keys absent from `updates` survive.
        let row: RowRecord = sqlx::query_as(
            r#"
            UPDATE sheet_rows
            SET fields = fields || $1, version = version + 1
            WHERE position = $2
            RETURNING version, fields
            "#,
        )
        .bind(Json(&updates))
        .bind(position)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(into_row(row))
    }

    async fn delete_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
    ) -> Result<Row, StoreError> {
        let row: Option<RowRecord> = sqlx::query_as(
            r#"
            DELETE FROM sheet_rows
            WHERE position = (
                SELECT position
                FROM sheet_rows
                WHERE table_name = $1 AND fields -> $2 = $3
                ORDER BY position ASC
                LIMIT 1
            )
            RETURNING version, fields
            "#,
        )
        .bind(table.as_str())
        .bind(key_column)
        .bind(Json(key_value))
        .fetch_optional(&self.pool)
        .await?;

        row.map(into_row).ok_or_else(|| StoreError::NotFound {
            table,
            column: key_column.to_owned(),
            value: key_value.clone(),
        })
    }

    async fn upsert_latest_within_window(
        &self,
        table: Table,
        device_id: &str,
        timestamp: DateTime<Utc>,
        mut fields: Fields,
        window: Duration,
    ) -> Result<Coalesced, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row locks cannot cover a device's first reading, so serialize per
        // device for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{device_id}", table.as_str()))
            .execute(&mut *tx)
            .await?;

        let latest: Option<(i64, Json<Fields>)> = sqlx::query_as(
            r#"
            SELECT position, fields
            FROM sheet_rows
            WHERE table_name = $1 AND fields ->> $2 = $3
            ORDER BY position DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(table.as_str())
        .bind(DEVICE_COLUMN)
        .bind(device_id)
        .fetch_optional(&mut *tx)
        .await?;

        let mergeable = latest.and_then(|(position, Json(existing))| {
            row_timestamp(&existing)
                .filter(|prev| within_window(*prev, timestamp, window))
                .map(|_| position)
        });

        let outcome = match mergeable {
            Some(position) => {
                fields.remove(TIMESTAMP_COLUMN);
                fields.remove(DEVICE_COLUMN);
                sqlx::query(
                    r#"
                    UPDATE sheet_rows
                    SET fields = fields || $1, version = version + 1
                    WHERE position = $2
                    "#,
                )
                .bind(Json(&fields))
                .bind(position)
                .execute(&mut *tx)
                .await?;
                Coalesced::Merged
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO sheet_rows (table_name, version, fields)
                    VALUES ($1, 1, $2)
                    "#,
                )
                .bind(table.as_str())
                .bind(Json(telemetry_row(device_id, timestamp, fields)))
                .execute(&mut *tx)
                .await?;
                Coalesced::Appended
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

// These need a live database: run with `DATABASE_URL` set and `--ignored`.
#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;
    use crate::store::conformance;

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn list_missing_table_is_empty(pool: PgPool) {
        conformance::list_missing_table_is_empty(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn update_touches_only_given_fields(pool: PgPool) {
        conformance::update_touches_only_given_fields(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn stale_version_is_rejected(pool: PgPool) {
        conformance::stale_version_is_rejected(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn delete_missing_key_leaves_table_unchanged(pool: PgPool) {
        conformance::delete_missing_key_leaves_table_unchanged(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn coalescing_merges_within_window(pool: PgPool) {
        conformance::coalescing_merges_within_window(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn update_hits_first_match_only(pool: PgPool) {
        conformance::update_hits_first_match_only(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn coalescing_is_per_device(pool: PgPool) {
        conformance::coalescing_is_per_device(&PgRowStore::new(pool)).await;
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_first_readings_share_a_row(pool: PgPool) {
        let store = PgRowStore::new(pool);
        let at = Utc::now();
        let writes = (0..8).map(|n| {
            let mut fields = Fields::new();
            fields.insert(format!("ch{n}"), serde_json::json!(n));
            store.upsert_latest_within_window(
                Table::SensorReadings,
                "fresh",
                at,
                fields,
                Duration::from_secs(60),
            )
        });
        for outcome in futures::future::join_all(writes).await {
            outcome.unwrap();
        }

        let rows = store.list_all(Table::SensorReadings).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.len(), 2 + 8);
    }
}
