//! Keyed row tables backing every hub action.
//!
//! A table is an ordered list of rows. Each row is a flat JSON object plus a
//! version counter. Lookups scan in storage order and act on the **first**
//! row whose key column equals the requested value.

pub mod memory;
pub mod postgres;

use std::{fmt, future::Future, time::Duration};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use memory::MemoryRowStore;
pub use postgres::PgRowStore;

/// Column holding the row timestamp in coalesced telemetry tables.
pub const TIMESTAMP_COLUMN: &str = "timestamp";
/// Column holding the reporting device id in coalesced telemetry tables.
pub const DEVICE_COLUMN: &str = "deviceId";

pub type Fields = Map<String, Value>;

/// One logical table per entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Devices,
    SensorReadings,
    AutomationRules,
    Users,
    ActivityLog,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Devices => "devices",
            Table::SensorReadings => "sensor_readings",
            Table::AutomationRules => "automation_rules",
            Table::Users => "users",
            Table::ActivityLog => "activity_log",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Starts at 1, bumped on every update.
    pub version: u64,
    pub fields: Fields,
}

impl Row {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(StoreError::Codec)
    }
}

/// Outcome of [`RowStore::upsert_latest_within_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// Fields were merged into the device's latest row.
    Merged,
    /// A new row was appended.
    Appended,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no row in {table} with {column} = {value}")]
    NotFound {
        table: Table,
        column: String,
        value: Value,
    },
    #[error("row in {table} changed concurrently (expected version {expected}, found {found})")]
    StaleVersion {
        table: Table,
        expected: u64,
        found: u64,
    },
    #[error("row encoding failed: {0}")]
    Codec(#[source] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Storage contract shared by every backend.
///
/// None of the operations take a lock across calls: two clients doing
/// read-modify-write on the same key race unless they pass
/// `expected_version` to [`RowStore::update_by_key`].
pub trait RowStore: Send + Sync + 'static {
    /// All rows in storage order. A table never written to is empty.
    fn list_all(&self, table: Table) -> impl Future<Output = Result<Vec<Row>, StoreError>> + Send;

    /// Append without any uniqueness check.
    fn append(&self, table: Table, fields: Fields)
        -> impl Future<Output = Result<Row, StoreError>> + Send;

    /// Merge `updates` into the first row whose `key_column` equals
    /// `key_value`. With `expected_version` set, a row at another version is
    /// rejected with [`StoreError::StaleVersion`].
    fn update_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
        updates: Fields,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<Row, StoreError>> + Send;

    /// Remove the first row whose `key_column` equals `key_value`.
    fn delete_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
    ) -> impl Future<Output = Result<Row, StoreError>> + Send;

    /// Merge `fields` into the latest row of `device_id` when that row's
    /// timestamp is within `window` of `timestamp`, else append a new row.
    ///
    /// Only the columns present in `fields` are written; the merged row
    /// keeps its original timestamp.
    fn upsert_latest_within_window(
        &self,
        table: Table,
        device_id: &str,
        timestamp: DateTime<Utc>,
        fields: Fields,
        window: Duration,
    ) -> impl Future<Output = Result<Coalesced, StoreError>> + Send;
}

/// Backend selected at startup.
#[derive(Clone)]
pub enum AnyRowStore {
    Memory(MemoryRowStore),
    Postgres(PgRowStore),
}

impl RowStore for AnyRowStore {
    async fn list_all(&self, table: Table) -> Result<Vec<Row>, StoreError> {
        match self {
            AnyRowStore::Memory(s) => s.list_all(table).await,
            AnyRowStore::Postgres(s) => s.list_all(table).await,
        }
    }

    async fn append(&self, table: Table, fields: Fields) -> Result<Row, StoreError> {
        match self {
            AnyRowStore::Memory(s) => s.append(table, fields).await,
            AnyRowStore::Postgres(s) => s.append(table, fields).await,
        }
    }

    async fn update_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
        updates: Fields,
        expected_version: Option<u64>,
    ) -> Result<Row, StoreError> {
        match self {
            AnyRowStore::Memory(s) => {
                s.update_by_key(table, key_column, key_value, updates, expected_version)
                    .await
            }
            AnyRowStore::Postgres(s) => {
                s.update_by_key(table, key_column, key_value, updates, expected_version)
                    .await
            }
        }
    }

    async fn delete_by_key(
        &self,
        table: Table,
        key_column: &str,
        key_value: &Value,
    ) -> Result<Row, StoreError> {
        match self {
            AnyRowStore::Memory(s) => s.delete_by_key(table, key_column, key_value).await,
            AnyRowStore::Postgres(s) => s.delete_by_key(table, key_column, key_value).await,
        }
    }

    async fn upsert_latest_within_window(
        &self,
        table: Table,
        device_id: &str,
        timestamp: DateTime<Utc>,
        fields: Fields,
        window: Duration,
    ) -> Result<Coalesced, StoreError> {
        match self {
            AnyRowStore::Memory(s) => {
                s.upsert_latest_within_window(table, device_id, timestamp, fields, window)
                    .await
            }
            AnyRowStore::Postgres(s) => {
                s.upsert_latest_within_window(table, device_id, timestamp, fields, window)
                    .await
            }
        }
    }
}

/// Serialize a record into row fields. Fails for non-object encodings.
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record).map_err(StoreError::Codec)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Codec(serde::ser::Error::custom(format!(
            "expected a JSON object, got {other}"
        )))),
    }
}

/// Shallow merge: every key in `updates` overwrites, every other key stays.
pub(crate) fn merge_fields(target: &mut Fields, updates: Fields) {
    for (k, v) in updates {
        target.insert(k, v);
    }
}

/// Timestamp of a telemetry row, if it carries a parseable one.
pub(crate) fn row_timestamp(fields: &Fields) -> Option<DateTime<Utc>> {
    fields
        .get(TIMESTAMP_COLUMN)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Whether two telemetry timestamps fall inside one coalescing window.
pub(crate) fn within_window(previous: DateTime<Utc>, next: DateTime<Utc>, window: Duration) -> bool {
    (next - previous)
        .abs()
        .to_std()
        .map(|gap| gap < window)
        .unwrap_or(false)
}

/// Fields of a freshly appended telemetry row.
pub(crate) fn telemetry_row(device_id: &str, timestamp: DateTime<Utc>, mut fields: Fields) -> Fields {
    fields.remove(TIMESTAMP_COLUMN);
    fields.insert(DEVICE_COLUMN.to_owned(), Value::String(device_id.to_owned()));
    fields.insert(
        TIMESTAMP_COLUMN.to_owned(),
        Value::String(timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
    );
    fields
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn window_is_symmetric_and_exclusive() {
        let base = Utc.timestamp_opt(1_000, 0).unwrap();
        let w = Duration::from_secs(60);
        assert!(within_window(base, base + chrono::Duration::seconds(30), w));
        assert!(within_window(base + chrono::Duration::seconds(30), base, w));
        assert!(!within_window(base, base + chrono::Duration::seconds(60), w));
        assert!(!within_window(base, base + chrono::Duration::seconds(90), w));
    }

    #[test]
    fn merge_keeps_absent_fields() {
        let mut target = conformance::fields(json!({"temp": 22, "humidity": 50}));
        merge_fields(&mut target, conformance::fields(json!({"humidity": 55})));
        assert_eq!(target["temp"], 22);
        assert_eq!(target["humidity"], 55);
    }

    #[test]
    fn telemetry_row_stamps_device_and_time() {
        let ts = Utc.timestamp_opt(1_767_225_600, 0).unwrap();
        let row = telemetry_row(
            "esp32_a",
            ts,
            conformance::fields(json!({"temp": 22, "timestamp": "ignored"})),
        );
        assert_eq!(row["deviceId"], "esp32_a");
        assert_eq!(row["timestamp"], "2026-01-01T00:00:00.000Z");
        assert_eq!(row_timestamp(&row), Some(ts));
    }

    #[test]
    fn to_fields_rejects_scalars() {
        assert!(to_fields(&json!({"a": 1})).is_ok());
        assert!(matches!(to_fields(&42), Err(StoreError::Codec(_))));
    }
}
