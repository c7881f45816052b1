use anyhow::Result;
use serde::Serialize;
use serde_json::Value as JsonValue;
use townfeed_core::RunSummary;
use townfeed_sources::tax::{self, TaxRatePayload};
use tracing::info;

use super::write_rows;
use crate::{JobContext, JobError};

#[derive(Debug, Serialize)]
pub struct TaxRatesSummary {
    pub year: i32,
    pub towns_processed: usize,
    pub upserted: usize,
    pub total_server_count: u64,
    pub unmatched: Vec<String>,
    pub run: RunSummary,
}

pub async fn run(ctx: &JobContext, payload: JsonValue) -> Result<JsonValue> {
    let payload = TaxRatePayload::from_value(payload).map_err(JobError::from)?;
    let entries = payload.rates.as_ref().map_or_else(
        || payload.rates_by_name.as_ref().map_or(0, |by_name| by_name.len()),
        Vec::len,
    );
    let batch = tax::build_rows(&payload, ctx.registry.as_ref()).map_err(JobError::from)?;
    info!(year = batch.year, rows = batch.rows.len(), "upserting tax rate records");

    let outcome = write_rows(ctx, &batch.rows).await?;
    let summary = TaxRatesSummary {
        year: batch.year,
        towns_processed: batch.rows.len(),
        upserted: outcome.written,
        total_server_count: outcome.total_server_count,
        unmatched: batch.unmatched.clone(),
        run: RunSummary {
            records_seen: entries,
            records_matched: batch.rows.len(),
            records_written: outcome.written,
            total_server_count: outcome.total_server_count,
            unmatched: batch.unmatched,
        },
    };
    Ok(serde_json::to_value(summary)?)
}
