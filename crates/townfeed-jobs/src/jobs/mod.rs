//! One module per job. Each returns its summary as JSON for the envelope.

pub mod census;
pub mod market_tracker;
pub mod mortgage_rates;
pub mod tax_rates;
pub mod zhvi;

use anyhow::{Context, Result};
use townfeed_core::{UpsertOutcome, UpsertRow};
use townfeed_storage::{upsert_rows, FeedError};

use crate::JobContext;

/// Run a feed-consuming closure on the blocking pool.
pub(crate) async fn on_blocking_pool<T, F>(source_id: &'static str, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T, FeedError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .with_context(|| format!("{source_id} stage did not complete"))?
        .with_context(|| format!("reading {source_id} feed"))
}

pub(crate) async fn write_rows<R: UpsertRow>(ctx: &JobContext, rows: &[R]) -> Result<UpsertOutcome> {
    upsert_rows(ctx.sink.as_ref(), rows, ctx.config.batch_size)
        .await
        .with_context(|| format!("upserting {}", R::TABLE))
}
