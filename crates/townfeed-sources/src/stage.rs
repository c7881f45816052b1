//! Filter, resolve, transform and deduplicate raw feed records.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use townfeed_core::{KeySpace, RunSummary, TownId, TownResolver, UpsertOutcome, UpsertRow};
use townfeed_storage::{FeedError, RawRecord};
use tracing::debug;

/// Per-source record handling plugged into [`FilterDedupeStage`].
pub trait FeedTransform {
    type Row: UpsertRow;

    fn source_id(&self) -> &'static str;

    /// Cheap check run before any registry lookup.
    fn admit(&self, record: &RawRecord) -> bool;

    /// The key space and raw key identifying the record's town.
    fn identity<'r>(&self, record: &'r RawRecord) -> Option<(KeySpace, Cow<'r, str>)>;

    /// Push zero or more rows for a resolved record. Pushing nothing drops the record
    /// as incomplete.
    fn build(&self, town: &TownId, record: &RawRecord, out: &mut Vec<Self::Row>);
}

/// Rows keyed by natural key; a later insert with the same key replaces the earlier row.
#[derive(Debug)]
pub struct RowSet<R: UpsertRow> {
    rows: BTreeMap<R::Key, R>,
}

impl<R: UpsertRow> Default for RowSet<R> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<R: UpsertRow> RowSet<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the row replaced an existing one.
    pub fn insert(&mut self, row: R) -> bool {
        self.rows.insert(row.natural_key(), row).is_some()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in natural-key order.
    pub fn into_rows(self) -> Vec<R> {
        self.rows.into_values().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub seen: usize,
    pub admitted: usize,
    pub matched: usize,
    pub dropped_incomplete: usize,
    pub towns: BTreeSet<TownId>,
    pub unmatched: BTreeSet<String>,
}

impl StageStats {
    pub fn summary(&self, outcome: &UpsertOutcome) -> RunSummary {
        RunSummary {
            records_seen: self.seen,
            records_matched: self.matched,
            records_written: outcome.written,
            total_server_count: outcome.total_server_count,
            unmatched: self.unmatched.iter().cloned().collect(),
        }
    }
}

#[derive(Debug)]
pub struct StageOutput<R> {
    pub rows: Vec<R>,
    pub stats: StageStats,
}

pub struct FilterDedupeStage<'a, T, R: ?Sized> {
    transform: &'a T,
    resolver: &'a R,
}

impl<'a, T, R> FilterDedupeStage<'a, T, R>
where
    T: FeedTransform,
    R: TownResolver + ?Sized,
{
    pub fn new(transform: &'a T, resolver: &'a R) -> Self {
        Self {
            transform,
            resolver,
        }
    }

    /// Consume `records` to the end. The first read error aborts the stage.
    pub fn run<I>(&self, records: I) -> Result<StageOutput<T::Row>, FeedError>
    where
        I: IntoIterator<Item = Result<RawRecord, FeedError>>,
    {
        let mut rows = RowSet::new();
        let mut stats = StageStats::default();
        let mut built = Vec::new();

        for record in records {
            let record = record?;
            stats.seen += 1;
            if !self.transform.admit(&record) {
                continue;
            }
            stats.admitted += 1;

            let Some((space, raw_key)) = self.transform.identity(&record) else {
                stats.dropped_incomplete += 1;
                continue;
            };
            let key = raw_key.trim();
            if key.is_empty() {
                stats.dropped_incomplete += 1;
                continue;
            }
            let Some(town) = self.resolver.resolve(space, key) else {
                if !stats.unmatched.contains(key) {
                    stats.unmatched.insert(key.to_string());
                }
                continue;
            };
            stats.matched += 1;
            if !stats.towns.contains(town) {
                stats.towns.insert(town.clone());
            }

            built.clear();
            self.transform.build(town, &record, &mut built);
            if built.is_empty() {
                stats.dropped_incomplete += 1;
                continue;
            }
            for row in built.drain(..) {
                rows.insert(row);
            }
        }

        debug!(
            source_id = self.transform.source_id(),
            seen = stats.seen,
            admitted = stats.admitted,
            matched = stats.matched,
            unique_rows = rows.len(),
            "stage complete"
        );
        Ok(StageOutput {
            rows: rows.into_rows(),
            stats,
        })
    }
}
