//! Chunked merge-on-conflict writes and the sink seam every backend implements.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use townfeed_core::{UpsertOutcome, UpsertRow};
use tracing::{error, info};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} failed for {table}: {status} {body}")]
    Rejected {
        operation: &'static str,
        table: String,
        status: u16,
        body: String,
    },
    #[error("request to {table} failed: {source}")]
    Transport {
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("encoding rows for {table}: {source}")]
    Encode {
        table: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoding response from {table}: {source}")]
    Decode {
        table: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid sql identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("postgres write to {table} failed: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("connecting to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("service key is not a valid header value")]
    InvalidServiceKey,
    #[error("building store client: {0}")]
    Client(#[source] reqwest::Error),
}

/// One write unit against the backing store.
#[async_trait]
pub trait UpsertSink: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Merge `chunk` into `table` on `conflict_keys`. Returns the store's affected-row
    /// count, or `None` when the store did not report one.
    async fn write_chunk(
        &self,
        table: &str,
        conflict_keys: &[&str],
        chunk: &[JsonValue],
    ) -> Result<Option<u64>, StoreError>;
}

/// Send `rows` in consecutive chunks of at most `batch_size`.
///
/// The first failing chunk aborts the rest; chunks already committed stay committed.
/// Empty input makes no calls.
pub async fn upsert<S, R>(
    sink: &S,
    table: &str,
    conflict_keys: &[&str],
    rows: &[R],
    batch_size: usize,
) -> Result<UpsertOutcome, StoreError>
where
    S: UpsertSink + ?Sized,
    R: Serialize,
{
    let mut outcome = UpsertOutcome::default();
    if rows.is_empty() {
        info!(table, "no rows to upsert");
        return Ok(outcome);
    }

    let batch_size = batch_size.max(1);
    let batches = rows.len().div_ceil(batch_size);
    for (index, chunk) in rows.chunks(batch_size).enumerate() {
        let payload = chunk
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Encode {
                table: table.to_string(),
                source,
            })?;

        match sink.write_chunk(table, conflict_keys, &payload).await {
            Ok(server_count) => {
                outcome.absorb(chunk.len(), server_count);
                info!(
                    table,
                    backend = sink.backend(),
                    batch = index + 1,
                    batches,
                    rows = chunk.len(),
                    server_count = ?server_count,
                    "upserted batch"
                );
            }
            Err(err) => {
                error!(
                    table,
                    backend = sink.backend(),
                    batch = index + 1,
                    batches,
                    error = %err,
                    "upsert batch failed; aborting remaining batches"
                );
                return Err(err);
            }
        }
    }

    Ok(outcome)
}

/// [`upsert`] using the row type's own table and conflict keys.
pub async fn upsert_rows<S, R>(
    sink: &S,
    rows: &[R],
    batch_size: usize,
) -> Result<UpsertOutcome, StoreError>
where
    S: UpsertSink + ?Sized,
    R: UpsertRow,
{
    upsert(sink, R::TABLE, R::CONFLICT_KEYS, rows, batch_size).await
}

/// In-process store with merge semantics, used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, JsonValue>>,
    chunk_sizes: HashMap<String, Vec<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.with_state(|state| state.tables.get(table).map_or(0, BTreeMap::len))
    }

    /// Stored rows ordered by their conflict-key tuple.
    pub fn rows(&self, table: &str) -> Vec<JsonValue> {
        self.with_state(|state| {
            state
                .tables
                .get(table)
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Size of every chunk received for `table`, in arrival order.
    pub fn chunk_sizes(&self, table: &str) -> Vec<usize> {
        self.with_state(|state| state.chunk_sizes.get(table).cloned().unwrap_or_default())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

fn missing_key(table: &str, key: &str) -> StoreError {
    StoreError::Rejected {
        operation: "upsert",
        table: table.to_string(),
        status: 400,
        body: format!("row is missing conflict column {key}"),
    }
}

#[async_trait]
impl UpsertSink for MemorySink {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn write_chunk(
        &self,
        table: &str,
        conflict_keys: &[&str],
        chunk: &[JsonValue],
    ) -> Result<Option<u64>, StoreError> {
        let mut keyed = Vec::with_capacity(chunk.len());
        for row in chunk {
            let mut parts = Vec::with_capacity(conflict_keys.len());
            for key in conflict_keys {
                let value = row
                    .get(*key)
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| missing_key(table, key))?;
                parts.push(value.clone());
            }
            keyed.push((JsonValue::Array(parts).to_string(), row));
        }

        self.with_state(|state| {
            let stored = state.tables.entry(table.to_string()).or_default();
            for (key, row) in keyed {
                match (stored.get_mut(&key), row.as_object()) {
                    (Some(JsonValue::Object(existing)), Some(incoming)) => {
                        for (column, value) in incoming {
                            existing.insert(column.clone(), value.clone());
                        }
                    }
                    _ => {
                        stored.insert(key, row.clone());
                    }
                }
            }
            state
                .chunk_sizes
                .entry(table.to_string())
                .or_default()
                .push(chunk.len());
        });

        Ok(Some(chunk.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| json!({"town_id": format!("town_{i}"), "year": 2023, "population": i}))
            .collect()
    }

    #[tokio::test]
    async fn splits_into_bounded_chunks() {
        let sink = MemorySink::new();
        let outcome = upsert(&sink, "town_demographics", &["town_id", "year"], &rows(1201), 500)
            .await
            .unwrap();
        assert_eq!(sink.chunk_sizes("town_demographics"), vec![500, 500, 201]);
        assert_eq!(outcome.written, 1201);
        assert_eq!(outcome.total_server_count, 1201);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let sink = MemorySink::new();
        let outcome = upsert::<_, JsonValue>(&sink, "tax_rates", &["town_id", "year"], &[], 500)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::default());
        assert!(sink.chunk_sizes("tax_rates").is_empty());
    }

    #[tokio::test]
    async fn repeated_upsert_merges_instead_of_duplicating() {
        let sink = MemorySink::new();
        let keys = ["town_id", "year"];
        upsert(&sink, "town_demographics", &keys, &rows(10), 4).await.unwrap();
        let before = sink.row_count("town_demographics");
        upsert(&sink, "town_demographics", &keys, &rows(10), 4).await.unwrap();
        assert_eq!(before, 10);
        assert_eq!(sink.row_count("town_demographics"), before);
    }

    #[tokio::test]
    async fn merge_leaves_absent_columns_untouched() {
        let sink = MemorySink::new();
        let keys = ["date"];
        upsert(&sink, "mortgage_rates", &keys, &[json!({"date": "2024-01-04", "rate_30yr": 6.62, "rate_15yr": 5.89})], 500)
            .await
            .unwrap();
        upsert(&sink, "mortgage_rates", &keys, &[json!({"date": "2024-01-04", "rate_30yr": 6.66})], 500)
            .await
            .unwrap();
        let stored = sink.rows("mortgage_rates");
        assert_eq!(stored, vec![json!({"date": "2024-01-04", "rate_30yr": 6.66, "rate_15yr": 5.89})]);
    }

    #[tokio::test]
    async fn rows_without_conflict_columns_are_rejected() {
        let sink = MemorySink::new();
        let err = upsert(&sink, "tax_rates", &["town_id", "year"], &[json!({"town_id": "hoboken"})], 500)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 400, .. }));
        assert_eq!(sink.row_count("tax_rates"), 0);
    }

    #[tokio::test]
    async fn zero_batch_size_is_treated_as_one() {
        let sink = MemorySink::new();
        upsert(&sink, "t", &["town_id", "year"], &rows(3), 0).await.unwrap();
        assert_eq!(sink.chunk_sizes("t"), vec![1, 1, 1]);
    }
}
