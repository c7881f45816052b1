use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use townfeed_core::RunSummary;
use townfeed_sources::fred::{self, SERIES_15YR, SERIES_30YR};
use tracing::info;

use super::write_rows;
use crate::JobContext;

#[derive(Debug, Serialize)]
pub struct MortgageRatesSummary {
    pub dates_fetched: usize,
    pub rates_30yr_count: usize,
    pub rates_15yr_count: usize,
    pub upserted: usize,
    pub total_server_count: u64,
    pub run: RunSummary,
}

pub async fn run(ctx: &JobContext) -> Result<JsonValue> {
    let source = &ctx.config.mortgage_rates;

    let rates_30yr = fred::fetch_series(&ctx.http, &source.url, SERIES_30YR, source.timeout)
        .await
        .with_context(|| format!("fetching {SERIES_30YR}"))?;
    let rates_15yr = fred::fetch_series(&ctx.http, &source.url, SERIES_15YR, source.timeout)
        .await
        .with_context(|| format!("fetching {SERIES_15YR}"))?;

    let rows = fred::merge_rates(&rates_30yr, &rates_15yr);
    info!(rows = rows.len(), "upserting mortgage rate records");
    let outcome = write_rows(ctx, &rows).await?;

    let summary = MortgageRatesSummary {
        dates_fetched: rows.len(),
        rates_30yr_count: rates_30yr.len(),
        rates_15yr_count: rates_15yr.len(),
        upserted: outcome.written,
        total_server_count: outcome.total_server_count,
        run: RunSummary {
            records_seen: rates_30yr.len() + rates_15yr.len(),
            records_matched: rows.len(),
            records_written: outcome.written,
            total_server_count: outcome.total_server_count,
            unmatched: Vec::new(),
        },
    };
    Ok(serde_json::to_value(summary)?)
}
