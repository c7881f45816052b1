//! PostgREST (Supabase REST) backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::sink::{StoreError, UpsertSink};

const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal,count=exact";

#[derive(Debug, Clone)]
pub struct PostgrestClient {
    client: reqwest::Client,
    rest_url: String,
}

impl PostgrestClient {
    pub fn new(
        base_url: &str,
        service_key: &str,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        let mut apikey =
            HeaderValue::from_str(service_key).map_err(|_| StoreError::InvalidServiceKey)?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .map_err(|_| StoreError::InvalidServiceKey)?;
        bearer.set_sensitive(true);
        headers.insert("apikey", apikey);
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(StoreError::Client)?;
        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{table}", self.rest_url)
    }

    /// Read rows back, e.g. `select("tax_rates", "*", &[("town_id", "eq.hoboken")])`.
    pub async fn select(
        &self,
        table: &str,
        columns: &str,
        filters: &[(String, String)],
    ) -> Result<Vec<JsonValue>, StoreError> {
        let mut query: Vec<(&str, &str)> = vec![("select", columns)];
        query.extend(filters.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let resp = self
            .client
            .get(self.table_url(table))
            .query(&query)
            .send()
            .await
            .map_err(|source| StoreError::Transport {
                table: table.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                operation: "select",
                table: table.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        resp.json().await.map_err(|source| StoreError::Decode {
            table: table.to_string(),
            source,
        })
    }
}

/// Total from a `Content-Range` value such as `0-499/500` or `*/500`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.parse().ok()
}

#[async_trait]
impl UpsertSink for PostgrestClient {
    fn backend(&self) -> &'static str {
        "postgrest"
    }

    async fn write_chunk(
        &self,
        table: &str,
        conflict_keys: &[&str],
        chunk: &[JsonValue],
    ) -> Result<Option<u64>, StoreError> {
        let span = info_span!("postgrest_upsert", table, rows = chunk.len());
        async {
            let resp = self
                .client
                .post(self.table_url(table))
                .header(CONTENT_TYPE, "application/json")
                .header("Prefer", UPSERT_PREFER)
                .query(&[("on_conflict", conflict_keys.join(","))])
                .json(chunk)
                .send()
                .await
                .map_err(|source| StoreError::Transport {
                    table: table.to_string(),
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(StoreError::Rejected {
                    operation: "upsert",
                    table: table.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }

            let count = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            debug!(status = status.as_u16(), count = ?count, "chunk accepted");
            Ok(count)
        }
        .instrument(span)
        .await
    }
}
