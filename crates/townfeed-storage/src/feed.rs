//! Incremental reader for large compressed delimited feeds.
//!
//! The HTTP body is consumed as a byte stream and decompressed and parsed as it
//! arrives; only the csv and gzip buffers are ever resident. Records are yielded
//! one at a time through a plain `Iterator`, so the consumer must run on a
//! blocking thread when the source is a [`RemoteFeed`].

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;
use std::time::Duration;

use csv::StringRecord;
use flate2::read::MultiGzDecoder;
use thiserror::Error;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::info;

use crate::http::{FetchError, HttpFetcher};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedFormat {
    pub delimiter: u8,
    pub compression: Compression,
    /// Accept records whose field count differs from the header.
    pub flexible: bool,
}

impl FeedFormat {
    pub const fn tsv_gz() -> Self {
        Self {
            delimiter: b'\t',
            compression: Compression::Gzip,
            flexible: true,
        }
    }

    pub const fn csv() -> Self {
        Self {
            delimiter: b',',
            compression: Compression::Plain,
            flexible: true,
        }
    }

    pub const fn strict(self) -> Self {
        Self {
            flexible: false,
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("opening feed stream: {0}")]
    Io(#[from] io::Error),
    #[error("reading feed header: {0}")]
    Header(#[source] csv::Error),
    #[error("reading feed record at line {line}: {source}")]
    Record {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

/// Column name to position lookup shared by every record of one feed.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

impl HeaderIndex {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(|name| name.as_ref().trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        let mut positions = HashMap::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            positions.entry(name.clone()).or_insert(index);
        }
        Self { names, positions }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One feed row, addressed by source column name. Short rows simply lack trailing columns.
#[derive(Debug, Clone)]
pub struct RawRecord {
    header: Arc<HeaderIndex>,
    fields: StringRecord,
}

impl RawRecord {
    pub fn new(header: Arc<HeaderIndex>, fields: StringRecord) -> Self {
        Self { header, fields }
    }

    pub fn from_values<I, S>(header: Arc<HeaderIndex>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(header, values.into_iter().collect())
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(self.header.position(column)?)
    }

    pub fn header(&self) -> &HeaderIndex {
        &self.header
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.header
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.fields.iter())
    }
}

/// Forward-only, non-restartable record sequence over any byte source.
pub struct FeedRecords {
    reader: csv::Reader<Box<dyn Read + Send>>,
    header: Arc<HeaderIndex>,
    done: bool,
}

impl FeedRecords {
    /// Wrap a byte source. With `Compression::Gzip` the stream is only decompressed when it
    /// actually starts with the gzip magic, since the transport may already have decoded it.
    pub fn from_reader<R>(reader: R, format: FeedFormat) -> Result<Self, FeedError>
    where
        R: Read + Send + 'static,
    {
        let mut buffered = BufReader::with_capacity(READ_BUFFER_BYTES, reader);
        let decoded: Box<dyn Read + Send> = match format.compression {
            Compression::Gzip if buffered.fill_buf()?.starts_with(&GZIP_MAGIC) => {
                Box::new(MultiGzDecoder::new(buffered))
            }
            _ => Box::new(buffered),
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(format.delimiter)
            .has_headers(true)
            .flexible(format.flexible)
            .from_reader(decoded);
        let header = Arc::new(HeaderIndex::new(
            reader.headers().map_err(FeedError::Header)?.iter(),
        ));

        Ok(Self {
            reader,
            header,
            done: false,
        })
    }

    pub fn header(&self) -> &Arc<HeaderIndex> {
        &self.header
    }
}

impl Iterator for FeedRecords {
    type Item = Result<RawRecord, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut fields = StringRecord::new();
        match self.reader.read_record(&mut fields) {
            Ok(true) => Some(Ok(RawRecord::new(Arc::clone(&self.header), fields))),
            Ok(false) => {
                self.done = true;
                None
            }
            Err(source) => {
                self.done = true;
                let line = source
                    .position()
                    .map(|p| p.line())
                    .unwrap_or_else(|| self.reader.position().line());
                Some(Err(FeedError::Record { line, source }))
            }
        }
    }
}

/// A feed whose response headers have arrived and whose body is still on the wire.
pub struct RemoteFeed {
    format: FeedFormat,
    body: Box<dyn Read + Send>,
}

impl RemoteFeed {
    /// Start decoding. Must be called from a blocking thread (`spawn_blocking`), because
    /// every read drives the async body through a sync bridge.
    pub fn into_records(self) -> Result<FeedRecords, FeedError> {
        FeedRecords::from_reader(self.body, self.format)
    }
}

/// Request a feed and hand back its body as a lazily read stream.
///
/// `idle` bounds the wait for the response headers and every gap between body chunks,
/// so a slow but live transfer of a large file is never cut off. A stall mid-body
/// surfaces as a read error from the record iterator.
pub async fn open_feed(
    http: &HttpFetcher,
    source_id: &str,
    url: &str,
    format: FeedFormat,
    idle: Duration,
) -> Result<RemoteFeed, FeedError> {
    let resp = http.send_streaming(source_id, url, idle).await?;
    info!(
        source_id,
        url,
        content_length = ?resp.content_length(),
        "streaming feed body"
    );
    let stream = futures::stream::try_unfold(resp, move |mut resp| async move {
        match tokio::time::timeout(idle, resp.chunk()).await {
            Ok(Ok(Some(chunk))) => Ok(Some((chunk, resp))),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(err)) => Err(io::Error::other(err)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("feed body stalled for {idle:?}"),
            )),
        }
    });
    let body = SyncIoBridge::new(StreamReader::new(Box::pin(stream)));
    Ok(RemoteFeed {
        format,
        body: Box::new(body),
    })
}
