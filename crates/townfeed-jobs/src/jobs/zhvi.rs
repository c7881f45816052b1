use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value as JsonValue;
use townfeed_core::{RunSummary, TownId};
use townfeed_sources::zhvi::{ZhviTransform, SOURCE_ID};
use townfeed_sources::FilterDedupeStage;
use townfeed_storage::{open_feed, FeedFormat};
use tracing::info;

use super::{on_blocking_pool, write_rows};
use crate::JobContext;

#[derive(Debug, Serialize)]
pub struct ZhviSummary {
    pub towns_matched: usize,
    pub towns_matched_list: Vec<TownId>,
    pub data_points: usize,
    pub date_range: String,
    pub unmatched_nj_cities: Vec<String>,
    pub upserted: usize,
    pub total_server_count: u64,
    pub run: RunSummary,
}

pub async fn run(ctx: &JobContext) -> Result<JsonValue> {
    let source = &ctx.config.zhvi;
    let feed = open_feed(&ctx.http, SOURCE_ID, &source.url, FeedFormat::csv(), source.timeout).await?;

    let registry = Arc::clone(&ctx.registry);
    let (output, date_range) = on_blocking_pool(SOURCE_ID, move || {
        let records = feed.into_records()?;
        let transform = ZhviTransform::from_header(records.header());
        info!(
            date_columns = transform.date_count(),
            range = %transform.date_range(),
            county_filter = transform.filters_county(),
            "zhvi header parsed"
        );
        let output = FilterDedupeStage::new(&transform, registry.as_ref()).run(records)?;
        Ok((output, transform.date_range()))
    })
    .await?;

    let stats = output.stats;
    info!(
        towns = stats.towns.len(),
        data_points = output.rows.len(),
        "zhvi values matched"
    );
    let outcome = write_rows(ctx, &output.rows).await?;

    let summary = ZhviSummary {
        towns_matched: stats.towns.len(),
        towns_matched_list: stats.towns.iter().cloned().collect(),
        data_points: output.rows.len(),
        date_range,
        unmatched_nj_cities: stats.unmatched.iter().cloned().collect(),
        upserted: outcome.written,
        total_server_count: outcome.total_server_count,
        run: stats.summary(&outcome),
    };
    Ok(serde_json::to_value(summary)?)
}
