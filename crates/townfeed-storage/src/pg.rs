//! Direct Postgres backend, for deployments that reach the database without PostgREST.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::sink::{StoreError, UpsertSink};

#[derive(Debug, Clone)]
pub struct PgUpsertSink {
    pool: PgPool,
}

impl PgUpsertSink {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn checked_identifier(name: &str) -> Result<&str, StoreError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Build the merge statement for one chunk. Columns come from the row objects; every
/// non-key column is overwritten from the incoming row on conflict.
pub fn merge_statement(
    table: &str,
    conflict_keys: &[&str],
    columns: &[&str],
) -> Result<String, StoreError> {
    let table = checked_identifier(table)?;
    for key in conflict_keys {
        checked_identifier(key)?;
    }
    for column in columns {
        checked_identifier(column)?;
    }

    let column_list = columns.join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_keys.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1) \
         ON CONFLICT ({}) {action}",
        conflict_keys.join(", ")
    ))
}

#[async_trait]
impl UpsertSink for PgUpsertSink {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn write_chunk(
        &self,
        table: &str,
        conflict_keys: &[&str],
        chunk: &[JsonValue],
    ) -> Result<Option<u64>, StoreError> {
        let Some(first) = chunk.first().and_then(JsonValue::as_object) else {
            return Ok(Some(0));
        };
        let columns: Vec<&str> = first.keys().map(String::as_str).collect();
        let sql = merge_statement(table, conflict_keys, &columns)?;
        debug!(table, sql = %sql, "merging chunk");

        let result = sqlx::query(&sql)
            .bind(JsonValue::Array(chunk.to_vec()))
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Database {
                table: table.to_string(),
                source,
            })?;
        Ok(Some(result.rows_affected()))
    }
}
