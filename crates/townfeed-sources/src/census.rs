//! ACS 5-year demographics from the Census Bureau API, one request per county.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use townfeed_core::coerce::{parse_count, parse_float, percent_of, ratio, residual_percent};
use townfeed_core::registry::STATE_FIPS;
use townfeed_core::{County, DemographicsRow, KeySpace, TownId};
use townfeed_storage::{FeedError, HeaderIndex, HttpFetcher, RawRecord};
use tracing::info;

use crate::stage::FeedTransform;
use crate::SourceError;

pub const SOURCE_ID: &str = "census-acs5";

pub const DEFAULT_BASE_URL: &str = "https://api.census.gov/data";

pub const DEFAULT_YEAR: i32 = 2023;

pub const POPULATION: &str = "B01003_001E";
pub const MEDIAN_INCOME: &str = "B19013_001E";
pub const MEDIAN_HOME_VALUE: &str = "B25077_001E";
pub const MEDIAN_AGE: &str = "B01002_001E";
pub const WHITE_NOT_HISPANIC: &str = "B03002_003E";
pub const ASIAN_NOT_HISPANIC: &str = "B03002_006E";
pub const HISPANIC: &str = "B03002_012E";
pub const BLACK_NOT_HISPANIC: &str = "B03002_004E";
pub const AGGREGATE_TRAVEL_TIME: &str = "B08013_001E";
pub const TOTAL_COMMUTERS: &str = "B08303_001E";

const VARIABLES: [&str; 11] = [
    "NAME",
    POPULATION,
    MEDIAN_INCOME,
    MEDIAN_HOME_VALUE,
    MEDIAN_AGE,
    WHITE_NOT_HISPANIC,
    ASIAN_NOT_HISPANIC,
    HISPANIC,
    BLACK_NOT_HISPANIC,
    AGGREGATE_TRAVEL_TIME,
    TOTAL_COMMUTERS,
];

const COUNTY_COLUMN: &str = "county";
const SUBDIVISION_COLUMN: &str = "county subdivision";

pub fn county_url(base_url: &str, year: i32, county: County) -> String {
    format!(
        "{}/{year}/acs/acs5?get={}&for=county+subdivision:*&in=state:{STATE_FIPS}&in=county:{}",
        base_url.trim_end_matches('/'),
        VARIABLES.join(","),
        county.fips()
    )
}

fn cell_text(cell: &JsonValue) -> String {
    match cell {
        JsonValue::Null => String::new(),
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Decode the API's array-of-arrays body; the first row is the header.
pub fn records_from_json(body: &[u8]) -> Result<Vec<RawRecord>, SourceError> {
    let table: Vec<Vec<JsonValue>> =
        serde_json::from_slice(body).map_err(|source| SourceError::Decode {
            source_id: SOURCE_ID,
            source,
        })?;
    let mut rows = table.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let header = Arc::new(HeaderIndex::new(header.iter().map(cell_text)));
    Ok(rows
        .map(|row| RawRecord::from_values(Arc::clone(&header), row.iter().map(cell_text)))
        .collect())
}

/// Fetch one county. Any fetch failure, including a non-success status, is an error.
pub async fn fetch_county(
    http: &HttpFetcher,
    base_url: &str,
    year: i32,
    county: County,
    timeout: Duration,
) -> Result<Vec<RawRecord>, SourceError> {
    let url = county_url(base_url, year, county);
    let response = http.fetch_bytes(SOURCE_ID, &url, timeout).await?;
    let records = records_from_json(&response.body)?;
    info!(county = county.name(), records = records.len(), "fetched county subdivisions");
    Ok(records)
}

/// Wrap already fetched records for the stage.
pub fn as_feed(records: Vec<RawRecord>) -> impl Iterator<Item = Result<RawRecord, FeedError>> {
    records.into_iter().map(Ok)
}

pub struct CensusTransform {
    year: i32,
}

impl CensusTransform {
    pub fn new(year: i32) -> Self {
        Self { year }
    }
}

impl FeedTransform for CensusTransform {
    type Row = DemographicsRow;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn admit(&self, _record: &RawRecord) -> bool {
        true
    }

    fn identity<'r>(&self, record: &'r RawRecord) -> Option<(KeySpace, Cow<'r, str>)> {
        let county = record.get(COUNTY_COLUMN)?.trim();
        let subdivision = record.get(SUBDIVISION_COLUMN)?.trim();
        if county.is_empty() || subdivision.is_empty() {
            return None;
        }
        Some((KeySpace::Fips, Cow::Owned(format!("{county}{subdivision}"))))
    }

    fn build(&self, town: &TownId, record: &RawRecord, out: &mut Vec<DemographicsRow>) {
        let count = |variable: &str| record.get(variable).and_then(parse_count);
        let population = count(POPULATION);
        let white = count(WHITE_NOT_HISPANIC);
        let asian = count(ASIAN_NOT_HISPANIC);
        let hispanic = count(HISPANIC);
        let black = count(BLACK_NOT_HISPANIC);
        let aggregate_travel = record
            .get(AGGREGATE_TRAVEL_TIME)
            .and_then(parse_float)
            .filter(|minutes| *minutes >= 0.0);

        out.push(DemographicsRow {
            town_id: town.clone(),
            year: self.year,
            population,
            median_income: count(MEDIAN_INCOME),
            median_home_value: count(MEDIAN_HOME_VALUE),
            median_age: record
                .get(MEDIAN_AGE)
                .and_then(parse_float)
                .filter(|age| *age >= 0.0),
            ethnic_white_pct: percent_of(white, population),
            ethnic_asian_pct: percent_of(asian, population),
            ethnic_hispanic_pct: percent_of(hispanic, population),
            ethnic_black_pct: percent_of(black, population),
            ethnic_other_pct: residual_percent(population, &[white, asian, hispanic, black]),
            commute_time_avg: ratio(aggregate_travel, count(TOTAL_COMMUTERS)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::CountingResolver;
    use crate::stage::FilterDedupeStage;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use townfeed_storage::{FetchError, HttpClientConfig};

    const BODY: &str = r#"[
        ["NAME","B01003_001E","B19013_001E","B25077_001E","B01002_001E","B03002_003E","B03002_006E","B03002_012E","B03002_004E","B08013_001E","B08303_001E","state","county","county subdivision"],
        ["Fort Lee borough, Bergen County, New Jersey","1000","120000","650000","44.1","500","300","200","100","150000","5000","34","003","24420"],
        ["Nowhere township, Bergen County, New Jersey","10","-666666666",null,"30.0","1","1","1","1","0","0","34","003","99999"]
    ]"#;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[test]
    fn county_url_requests_every_variable() {
        let url = county_url("https://api.census.gov/data/", 2023, County::Hudson);
        assert!(url.starts_with("https://api.census.gov/data/2023/acs/acs5?get=NAME,B01003_001E,"));
        assert!(url.contains("B08303_001E&for=county+subdivision:*"));
        assert!(url.ends_with("&in=state:34&in=county:017"));
    }

    #[test]
    fn derives_percentages_and_residual() {
        let records = records_from_json(BODY.as_bytes()).unwrap();
        assert_eq!(records[1].get("B25077_001E"), Some(""));
        let resolver = CountingResolver::new(&[("00324420", "fort_lee")]);
        let transform = CensusTransform::new(2022);
        let output = FilterDedupeStage::new(&transform, &resolver)
            .run(as_feed(records))
            .unwrap();

        assert_eq!(output.rows.len(), 1);
        let row = &output.rows[0];
        assert_eq!(row.year, 2022);
        assert_eq!(row.population, Some(1000));
        assert_eq!(row.ethnic_white_pct, Some(50.0));
        assert_eq!(row.ethnic_asian_pct, Some(30.0));
        assert_eq!(row.ethnic_hispanic_pct, Some(20.0));
        assert_eq!(row.ethnic_black_pct, Some(10.0));
        assert_eq!(row.ethnic_other_pct, Some(-10.0));
        assert_eq!(row.commute_time_avg, Some(30.0));
        assert_eq!(row.median_age, Some(44.1));
        assert_eq!(output.stats.unmatched.iter().collect::<Vec<_>>(), vec!["00399999"]);
    }

    #[test]
    fn sentinels_become_absent() {
        let records = records_from_json(BODY.as_bytes()).unwrap();
        let resolver = CountingResolver::new(&[("00399999", "nowhere")]);
        let transform = CensusTransform::new(2023);
        let output = FilterDedupeStage::new(&transform, &resolver)
            .run(as_feed(records))
            .unwrap();
        let row = &output.rows[0];
        assert_eq!(row.median_income, None);
        assert_eq!(row.median_home_value, None);
        assert_eq!(row.commute_time_avg, None);
    }

    #[test]
    fn header_only_and_empty_bodies_yield_nothing() {
        assert!(records_from_json(b"[]").unwrap().is_empty());
        assert!(records_from_json(br#"[["NAME","county"]]"#).unwrap().is_empty());
        assert!(matches!(
            records_from_json(b"<html>"),
            Err(SourceError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn error_status_is_fatal() {
        let base = spawn(Router::new().route(
            "/2023/acs/acs5",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        ))
        .await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetch_county(&http, &base, 2023, County::Bergen, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn fetches_county_records() {
        let base = spawn(Router::new().route("/2023/acs/acs5", get(|| async { BODY }))).await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let records = fetch_county(&http, &base, 2023, County::Bergen, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("county subdivision"), Some("24420"));
    }
}
