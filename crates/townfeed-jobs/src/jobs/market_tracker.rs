use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value as JsonValue;
use townfeed_core::{RunSummary, UpsertOutcome};
use townfeed_sources::market::SOURCE_ID;
use townfeed_sources::{FilterDedupeStage, MarketColumns, MarketTransform};
use townfeed_storage::{open_feed, FeedFormat};
use tracing::info;

use super::{on_blocking_pool, write_rows};
use crate::JobContext;

#[derive(Debug, Serialize)]
pub struct MarketTrackerSummary {
    pub nj_lines_total: usize,
    pub towns_matched: usize,
    pub rows_upserted: usize,
    pub unmatched_nj_cities: Vec<String>,
    pub upsert_result: UpsertOutcome,
    pub run: RunSummary,
}

pub async fn run(ctx: &JobContext) -> Result<JsonValue> {
    let source = &ctx.config.market_tracker;
    info!(url = %source.url, columns = %ctx.config.market_columns, "streaming market tracker feed");
    let feed = open_feed(&ctx.http, SOURCE_ID, &source.url, FeedFormat::tsv_gz(), source.timeout).await?;

    let registry = Arc::clone(&ctx.registry);
    let transform = MarketTransform::new(MarketColumns::for_style(ctx.config.market_columns));
    let output = on_blocking_pool(SOURCE_ID, move || {
        let records = feed.into_records()?;
        FilterDedupeStage::new(&transform, registry.as_ref()).run(records)
    })
    .await?;

    let stats = output.stats;
    info!(
        nj_lines = stats.admitted,
        rows = output.rows.len(),
        towns = stats.towns.len(),
        "market tracker feed filtered"
    );
    if !stats.unmatched.is_empty() {
        info!(unmatched = ?stats.unmatched, "unmatched NJ cities in market tracker");
    }

    let outcome = write_rows(ctx, &output.rows).await?;
    let summary = MarketTrackerSummary {
        nj_lines_total: stats.admitted,
        towns_matched: stats.towns.len(),
        rows_upserted: output.rows.len(),
        unmatched_nj_cities: stats.unmatched.iter().cloned().collect(),
        upsert_result: outcome,
        run: stats.summary(&outcome),
    };
    Ok(serde_json::to_value(summary)?)
}
