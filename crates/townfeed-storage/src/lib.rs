//! Upstream fetching, streaming feed decoding and store backends for townfeed.

pub mod feed;
pub mod http;
pub mod pg;
pub mod postgrest;
pub mod sink;

pub use feed::{open_feed, Compression, FeedError, FeedFormat, FeedRecords, HeaderIndex, RawRecord, RemoteFeed};
pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use pg::PgUpsertSink;
pub use postgrest::PostgrestClient;
pub use sink::{upsert, upsert_rows, MemorySink, StoreError, UpsertSink, DEFAULT_BATCH_SIZE};

pub const CRATE_NAME: &str = "townfeed-storage";
