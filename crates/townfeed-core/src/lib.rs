//! Core domain model for townfeed: town identifiers, table rows and run summaries.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod coerce;
pub mod registry;

pub use registry::{County, KeySpace, RegistryError, Town, TownRegistry, TownResolver};

pub const CRATE_NAME: &str = "townfeed-core";

/// Canonical municipality identifier (`fort_lee`, `jersey_city`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TownId(String);

impl TownId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TownId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TownId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A row destined for one store table, merged on its natural key.
///
/// `CONFLICT_KEYS` must match the table's uniqueness constraint exactly, and
/// `natural_key` must project the same columns.
pub trait UpsertRow: Serialize + Send + Sync + 'static {
    const TABLE: &'static str;
    const CONFLICT_KEYS: &'static [&'static str];
    type Key: Ord + Clone + fmt::Debug + Send;

    fn natural_key(&self) -> Self::Key;
}

/// Comma-joined conflict column list as the store expects it.
pub fn conflict_columns<R: UpsertRow>() -> String {
    R::CONFLICT_KEYS.join(",")
}

/// ACS 5-year demographics per town and survey year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicsRow {
    pub town_id: TownId,
    pub year: i32,
    pub population: Option<i64>,
    pub median_income: Option<i64>,
    pub median_home_value: Option<i64>,
    pub median_age: Option<f64>,
    pub ethnic_white_pct: Option<f64>,
    pub ethnic_asian_pct: Option<f64>,
    pub ethnic_hispanic_pct: Option<f64>,
    pub ethnic_black_pct: Option<f64>,
    pub ethnic_other_pct: Option<f64>,
    pub commute_time_avg: Option<f64>,
}

impl UpsertRow for DemographicsRow {
    const TABLE: &'static str = "town_demographics";
    const CONFLICT_KEYS: &'static [&'static str] = &["town_id", "year"];
    type Key = (TownId, i32);

    fn natural_key(&self) -> Self::Key {
        (self.town_id.clone(), self.year)
    }
}

/// Weekly national fixed mortgage rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MortgageRateRow {
    pub date: NaiveDate,
    pub rate_30yr: Option<f64>,
    pub rate_15yr: Option<f64>,
}

impl UpsertRow for MortgageRateRow {
    const TABLE: &'static str = "mortgage_rates";
    const CONFLICT_KEYS: &'static [&'static str] = &["date"];
    type Key = NaiveDate;

    fn natural_key(&self) -> Self::Key {
        self.date
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxRateRow {
    pub town_id: TownId,
    pub year: i32,
    pub general_tax_rate: Option<f64>,
    pub effective_tax_rate: Option<f64>,
    pub equalization_ratio: Option<f64>,
    pub avg_residential_tax: Option<f64>,
}

impl UpsertRow for TaxRateRow {
    const TABLE: &'static str = "tax_rates";
    const CONFLICT_KEYS: &'static [&'static str] = &["town_id", "year"];
    type Key = (TownId, i32);

    fn natural_key(&self) -> Self::Key {
        (self.town_id.clone(), self.year)
    }
}

pub const ZHVI_HOME_TYPE_ALL: &str = "all_homes";

/// One monthly Zillow Home Value Index observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZhviRow {
    pub town_id: TownId,
    pub date: NaiveDate,
    pub zhvi_value: f64,
    pub home_type: String,
}

impl UpsertRow for ZhviRow {
    const TABLE: &'static str = "zhvi_values";
    const CONFLICT_KEYS: &'static [&'static str] = &["town_id", "date", "home_type"];
    type Key = (TownId, NaiveDate, String);

    fn natural_key(&self) -> Self::Key {
        (self.town_id.clone(), self.date, self.home_type.clone())
    }
}

/// One Redfin market tracker period for a town and property type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataRow {
    pub town_id: TownId,
    pub period_begin: NaiveDate,
    pub period_end: Option<NaiveDate>,
    pub property_type: String,
    pub median_sale_price: Option<f64>,
    pub median_list_price: Option<f64>,
    pub median_ppsf: Option<f64>,
    pub homes_sold: Option<i64>,
    pub new_listings: Option<i64>,
    pub inventory: Option<i64>,
    pub months_of_supply: Option<f64>,
    pub median_dom: Option<i64>,
    pub avg_sale_to_list: Option<f64>,
    pub sold_above_list_pct: Option<f64>,
    pub price_drops_pct: Option<f64>,
    pub off_market_in_two_weeks_pct: Option<f64>,
}

impl UpsertRow for MarketDataRow {
    const TABLE: &'static str = "market_data";
    const CONFLICT_KEYS: &'static [&'static str] = &["town_id", "period_begin", "property_type"];
    type Key = (TownId, NaiveDate, String);

    fn natural_key(&self) -> Self::Key {
        (
            self.town_id.clone(),
            self.period_begin,
            self.property_type.clone(),
        )
    }
}

/// Aggregated result of a chunked upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    /// Rows sent to the store.
    pub written: usize,
    /// Sum of per-chunk counts reported by the store (chunk length when unreported).
    pub total_server_count: u64,
}

impl UpsertOutcome {
    pub fn absorb(&mut self, chunk_len: usize, server_count: Option<u64>) {
        self.written += chunk_len;
        self.total_server_count += server_count.unwrap_or(chunk_len as u64);
    }
}

/// Counts every job reports alongside its own summary fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub records_seen: usize,
    pub records_matched: usize,
    pub records_written: usize,
    pub total_server_count: u64,
    /// Raw identifiers that did not resolve to a town, sorted and unique.
    pub unmatched: Vec<String>,
}
