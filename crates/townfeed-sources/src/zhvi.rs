//! Zillow Home Value Index, city level. One wide row per region with a column per month.

use std::borrow::Cow;

use chrono::NaiveDate;
use townfeed_core::coerce::parse_float;
use townfeed_core::{County, KeySpace, TownId, ZhviRow, ZHVI_HOME_TYPE_ALL};
use townfeed_storage::{HeaderIndex, RawRecord};

use crate::stage::FeedTransform;

pub const SOURCE_ID: &str = "zillow-zhvi";

pub const DEFAULT_URL: &str = "https://files.zillowstatic.com/research/public_csvs/zhvi/\
City_zhvi_uc_sfrcondo_tier_0.33_0.67_sm_sa_month.csv";

const STATE_COLUMN: &str = "StateName";
const REGION_COLUMN: &str = "RegionName";
const COUNTY_COLUMN: &str = "CountyName";
const ADMITTED_STATES: [&str; 2] = ["NJ", "New Jersey"];

/// Header cells shaped `YYYY-MM-DD` that parse as calendar dates, in header order.
pub fn date_columns(header: &HeaderIndex) -> Vec<(String, NaiveDate)> {
    header
        .names()
        .iter()
        .filter(|name| {
            let bytes = name.as_bytes();
            bytes.len() == 10 && bytes[4] == b'-' && bytes[7] == b'-'
        })
        .filter_map(|name| {
            NaiveDate::parse_from_str(name, "%Y-%m-%d")
                .ok()
                .map(|date| (name.clone(), date))
        })
        .collect()
}

/// `"Bergen County"` or `"Bergen"` for one of the covered counties.
fn is_covered_county(raw: &str) -> bool {
    let name = raw.trim();
    let name = name.strip_suffix(" County").unwrap_or(name).trim_end();
    County::ALL
        .iter()
        .any(|county| county.name().eq_ignore_ascii_case(name))
}

pub struct ZhviTransform {
    dates: Vec<(String, NaiveDate)>,
    county_filter: bool,
}

impl ZhviTransform {
    /// Same-named places exist in other NJ counties, so rows are also filtered on
    /// `CountyName` whenever the header carries it.
    pub fn from_header(header: &HeaderIndex) -> Self {
        Self {
            dates: date_columns(header),
            county_filter: header.position(COUNTY_COLUMN).is_some(),
        }
    }

    pub fn filters_county(&self) -> bool {
        self.county_filter
    }

    pub fn date_count(&self) -> usize {
        self.dates.len()
    }

    /// `"first to last"` over the header's date columns, or `"none"`.
    pub fn date_range(&self) -> String {
        match (self.dates.first(), self.dates.last()) {
            (Some((first, _)), Some((last, _))) => format!("{first} to {last}"),
            _ => "none".to_string(),
        }
    }
}

impl FeedTransform for ZhviTransform {
    type Row = ZhviRow;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn admit(&self, record: &RawRecord) -> bool {
        let in_state = record
            .get(STATE_COLUMN)
            .is_some_and(|state| ADMITTED_STATES.contains(&state.trim()));
        in_state && (!self.county_filter || record.get(COUNTY_COLUMN).is_some_and(is_covered_county))
    }

    fn identity<'r>(&self, record: &'r RawRecord) -> Option<(KeySpace, Cow<'r, str>)> {
        record
            .get(REGION_COLUMN)
            .map(|region| (KeySpace::Zillow, Cow::Borrowed(region)))
    }

    fn build(&self, town: &TownId, record: &RawRecord, out: &mut Vec<ZhviRow>) {
        for (column, date) in &self.dates {
            let Some(value) = record.get(column).and_then(parse_float) else {
                continue;
            };
            out.push(ZhviRow {
                town_id: town.clone(),
                date: *date,
                zhvi_value: value,
                home_type: ZHVI_HOME_TYPE_ALL.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::{records, CountingResolver};
    use crate::stage::FilterDedupeStage;

    const HEADER: &[&str] = &[
        "RegionID",
        "SizeRank",
        "RegionName",
        "RegionType",
        "StateName",
        "2000-01-31",
        "2000-02-29",
        "2024-13-01",
        "Metro",
    ];

    #[test]
    fn detects_only_real_date_columns() {
        let header = HeaderIndex::new(HEADER);
        let dates = date_columns(&header);
        assert_eq!(dates.len(), 2);
        assert_eq!(dates[1].1, NaiveDate::from_ymd_opt(2000, 2, 29).unwrap());
        let transform = ZhviTransform::from_header(&header);
        assert_eq!(transform.date_range(), "2000-01-31 to 2000-02-29");
        assert_eq!(ZhviTransform::from_header(&HeaderIndex::new(["RegionName"])).date_range(), "none");
    }

    #[test]
    fn emits_one_row_per_populated_month() {
        let resolver = CountingResolver::new(&[("Ho Ho Kus", "ho_ho_kus"), ("Hoboken", "hoboken")]);
        let input = records(
            HEADER,
            &[
                &["1", "10", "Hoboken", "city", "NJ", "400000.5", "", "1", "NYC"],
                &["2", "11", "Ho Ho Kus", "city", "New Jersey", "", "650000", "", "NYC"],
                &["3", "12", "Hoboken", "city", "PA", "1", "1", "1", ""],
                &["4", "13", "Brick", "city", "NJ", "1", "1", "1", ""],
            ],
        );
        let header = HeaderIndex::new(HEADER);
        let transform = ZhviTransform::from_header(&header);
        let output = FilterDedupeStage::new(&transform, &resolver).run(input).unwrap();

        assert_eq!(output.rows.len(), 2);
        assert!(output.rows.iter().all(|r| r.home_type == "all_homes"));
        assert_eq!(output.rows[0].town_id.as_str(), "ho_ho_kus");
        assert_eq!(output.rows[0].zhvi_value, 650000.0);
        assert_eq!(output.rows[1].zhvi_value, 400000.5);
        assert_eq!(output.stats.admitted, 3);
        assert_eq!(output.stats.unmatched.iter().collect::<Vec<_>>(), vec!["Brick"]);
    }

    #[test]
    fn same_named_towns_in_other_counties_are_not_admitted() {
        let header = [
            "RegionID", "RegionName", "StateName", "CountyName", "2024-01-31",
        ];
        let input = records(
            &header,
            &[
                &["1", "Fairfield", "NJ", "Essex County", "900000"],
                &["2", "Fairfield", "NJ", "Cumberland County", "210000"],
                &["3", "Washington", "NJ", "Bergen County", "800000"],
                &["4", "Washington", "NJ", "Warren County", "300000"],
                &["5", "Hoboken", "NJ", "", "700000"],
            ],
        );
        let registry = townfeed_core::TownRegistry::bundled().unwrap();
        let transform = ZhviTransform::from_header(&HeaderIndex::new(header));
        assert!(transform.filters_county());
        let output = FilterDedupeStage::new(&transform, &registry).run(input).unwrap();

        let values: Vec<_> = output
            .rows
            .iter()
            .map(|row| (row.town_id.as_str(), row.zhvi_value))
            .collect();
        assert_eq!(values, vec![("fairfield", 900000.0), ("washington_township", 800000.0)]);
        assert_eq!(output.stats.admitted, 2);
        assert!(output.stats.unmatched.is_empty());
    }

    #[test]
    fn county_names_match_with_or_without_suffix() {
        assert!(is_covered_county("Hudson County"));
        assert!(is_covered_county(" essex "));
        assert!(!is_covered_county("Passaic County"));
        assert!(!is_covered_county(""));
    }
}
