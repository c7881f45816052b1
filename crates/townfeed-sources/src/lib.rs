//! Source-specific transforms for the five townfeed upstreams and the shared
//! filter-dedupe stage they plug into.

pub mod census;
pub mod fred;
pub mod market;
pub mod stage;
pub mod tax;
pub mod zhvi;

use thiserror::Error;
use townfeed_storage::{FeedError, FetchError};

pub use market::{ColumnStyle, MarketColumns, MarketTransform};
pub use stage::{FeedTransform, FilterDedupeStage, RowSet, StageOutput, StageStats};
pub use tax::{PayloadError, TaxRatePayload};

pub const CRATE_NAME: &str = "townfeed-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("decoding {source_id} response: {source}")]
    Decode {
        source_id: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown market column style {0:?} (expected uppercase or lowercase)")]
    UnknownColumnStyle(String),
}
