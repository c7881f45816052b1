//! Weekly fixed mortgage rates from FRED graph CSV exports.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::time::Duration;

use chrono::NaiveDate;
use townfeed_core::coerce::parse_float;
use townfeed_core::MortgageRateRow;
use townfeed_storage::{FeedFormat, FeedRecords, HttpFetcher};
use tracing::info;

use crate::SourceError;

pub const SOURCE_ID: &str = "fred-mortgage-rates";

pub const DEFAULT_BASE_URL: &str = "https://fred.stlouisfed.org/graph/fredgraph.csv";

pub const SERIES_30YR: &str = "MORTGAGE30US";
pub const SERIES_15YR: &str = "MORTGAGE15US";

/// Observations are requested from this date on.
pub fn observation_start() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2020, 1, 1)
}

pub fn series_url(base_url: &str, series_id: &str, since: Option<NaiveDate>) -> String {
    match since {
        Some(since) => format!("{base_url}?id={series_id}&cosd={since}"),
        None => format!("{base_url}?id={series_id}"),
    }
}

/// Date in the first column, value in the second. Rows with an unparseable date or a
/// missing value (`.` or empty) are skipped.
pub fn parse_series(body: &[u8]) -> Result<BTreeMap<NaiveDate, f64>, SourceError> {
    let records = FeedRecords::from_reader(Cursor::new(body.to_vec()), FeedFormat::csv())?;
    let mut rates = BTreeMap::new();
    for record in records {
        let record = record?;
        let mut cells = record.iter().map(|(_, value)| value.trim());
        let (Some(date), Some(value)) = (cells.next(), cells.next()) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            continue;
        };
        if let Some(rate) = parse_float(value) {
            rates.insert(date, rate);
        }
    }
    Ok(rates)
}

pub async fn fetch_series(
    http: &HttpFetcher,
    base_url: &str,
    series_id: &str,
    timeout: Duration,
) -> Result<BTreeMap<NaiveDate, f64>, SourceError> {
    let url = series_url(base_url, series_id, observation_start());
    let response = http.fetch_bytes(SOURCE_ID, &url, timeout).await?;
    let rates = parse_series(&response.body)?;
    info!(series_id, observations = rates.len(), "fetched series");
    Ok(rates)
}

/// One row per date present in either series, in date order.
pub fn merge_rates(
    rates_30yr: &BTreeMap<NaiveDate, f64>,
    rates_15yr: &BTreeMap<NaiveDate, f64>,
) -> Vec<MortgageRateRow> {
    let dates: BTreeSet<NaiveDate> = rates_30yr.keys().chain(rates_15yr.keys()).copied().collect();
    dates
        .into_iter()
        .map(|date| MortgageRateRow {
            date,
            rate_30yr: rates_30yr.get(&date).copied(),
            rate_15yr: rates_15yr.get(&date).copied(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn reads_either_date_header_spelling() {
        let legacy = parse_series(b"DATE,MORTGAGE30US\n2024-01-04,6.62\n2024-01-11,.\n").unwrap();
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[&date(2024, 1, 4)], 6.62);

        let current =
            parse_series(b"observation_date,MORTGAGE15US\n2024-01-04,5.89\n2024-01-11,\nbad,1.0\n")
                .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[&date(2024, 1, 4)], 5.89);
    }

    #[test]
    fn merges_series_by_date_with_gaps_as_absent() {
        let r30 = BTreeMap::from([(date(2024, 1, 11), 6.66), (date(2024, 1, 4), 6.62)]);
        let r15 = BTreeMap::from([(date(2024, 1, 4), 5.89), (date(2024, 1, 18), 5.76)]);
        let rows = merge_rates(&r30, &r15);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, date(2024, 1, 4));
        assert_eq!((rows[0].rate_30yr, rows[0].rate_15yr), (Some(6.62), Some(5.89)));
        assert_eq!((rows[1].rate_30yr, rows[1].rate_15yr), (Some(6.66), None));
        assert_eq!((rows[2].rate_30yr, rows[2].rate_15yr), (None, Some(5.76)));
    }

    #[test]
    fn series_url_carries_start_date() {
        assert_eq!(
            series_url(DEFAULT_BASE_URL, SERIES_30YR, observation_start()),
            "https://fred.stlouisfed.org/graph/fredgraph.csv?id=MORTGAGE30US&cosd=2020-01-01"
        );
    }
}
