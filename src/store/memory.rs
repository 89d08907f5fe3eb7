use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    merge_fields, row_timestamp, telemetry_row, within_window, Coalesced, Fields, Row, RowStore,
    StoreError, Table, DEVICE_COLUMN,
};

/// Process-local tables, used for demo mode and tests.
///
/// Cloning shares the same tables. Each call takes the lock once, so a
/// single call is atomic here even though the trait does not promise it.
#[derive(Clone, Default)]
pub struct MemoryRowStore {
    tables: Arc<RwLock<HashMap<Table, Vec<Row>>>>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(table: Table, column: &str, value: &Value) -> StoreError {
    StoreError::NotFound {
        table,
        column: column.to_owned(),
        value: value.clone(),
    }
}

impl RowStore for MemoryRowStore {
    async fn list_all(&self, table: Table) -> Result<Vec<Row>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, table: Table, fields: Fields) -> Result<Row, StoreError> {
        let row = Row { version: 1, fields };
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
        updates: Fields,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError> {
        let mut tables = self.tables.write().await;
        let row = tables
            .get_mut(&table)
            .and_then(|rows| rows.iter_mut().find(|r| r.fields.get(key_column) == Some(key_value)))
            .ok_or_else(|| not_found(table, key_column, key_value))?;

        if let Some(expected) = expected_version {
            if row.version != expected {
                return Err(StoreError::StaleVersion {
                    table,
                    expected,
                    found: row.version,
                });
            }
        }

        merge_fields(&mut row.fields, updates);
        row.version += 1;
        Ok(row.clone())
    }

    async fn delete_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
    ) -> Result<Row, StoreError> {
        let mut tables = self.tables.write().await;
        let rows = tables
            .get_mut(&table)
            .ok_or_else(|| not_found(table, key_column, key_value))?;
        let index = rows
            .iter()
            .position(|r| r.fields.get(key_column) == Some(key_value))
            .ok_or_else(|| not_found(table, key_column, key_value))?;
        Ok(rows.remove(index))
    }

    async fn upsert_latest_within_window(
        &self,
        table: Table,
        device_id: &str,
        timestamp: DateTime<Utc>,
        mut fields: Fields,
        window: Duration,
    ) -> Result<Coalesced, StoreError> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();

        let latest = rows
            .iter_mut()
            .rev()
            .find(|r| r.fields.get(DEVICE_COLUMN).and_then(Value::as_str) == Some(device_id));

        if let Some(row) = latest {
            if row_timestamp(&row.fields).is_some_and(|prev| within_window(prev, timestamp, window)) {
                fields.remove(super::TIMESTAMP_COLUMN);
                fields.remove(DEVICE_COLUMN);
                merge_fields(&mut row.fields, fields);
                row.version += 1;
                return Ok(Coalesced::Merged);
            }
        }

        rows.push(Row {
            version: 1,
            fields: telemetry_row(device_id, timestamp, fields),
        });
        Ok(Coalesced::Appended)
    }
}
