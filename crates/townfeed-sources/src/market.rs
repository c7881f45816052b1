//! Redfin city market tracker.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use townfeed_core::coerce::{parse_amount, parse_count, parse_float};
use townfeed_core::{KeySpace, MarketDataRow, TownId};
use townfeed_storage::RawRecord;

use crate::stage::FeedTransform;
use crate::SourceError;

pub const SOURCE_ID: &str = "redfin-market-tracker";

pub const DEFAULT_URL: &str = "https://redfin-public-data.s3.us-west-2.amazonaws.com/\
redfin_market_tracker/city/us/city_market_tracker.tsv000.gz";

pub const STATE_CODE: &str = "NJ";

/// Header spelling of the market tracker file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnStyle {
    #[default]
    Uppercase,
    Lowercase,
}

impl fmt::Display for ColumnStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnStyle::Uppercase => f.write_str("uppercase"),
            ColumnStyle::Lowercase => f.write_str("lowercase"),
        }
    }
}

impl FromStr for ColumnStyle {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uppercase" | "upper" => Ok(ColumnStyle::Uppercase),
            "lowercase" | "lower" => Ok(ColumnStyle::Lowercase),
            other => Err(SourceError::UnknownColumnStyle(other.to_string())),
        }
    }
}

/// Feed column names for every field the transform reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketColumns {
    pub state_code: String,
    pub city: String,
    pub period_begin: String,
    pub period_end: String,
    pub property_type: String,
    pub median_sale_price: String,
    pub median_list_price: String,
    pub median_ppsf: String,
    pub homes_sold: String,
    pub new_listings: String,
    pub inventory: String,
    pub months_of_supply: String,
    pub median_dom: String,
    pub avg_sale_to_list: String,
    pub sold_above_list_pct: String,
    pub price_drops_pct: String,
    pub off_market_in_two_weeks_pct: String,
}

impl MarketColumns {
    fn with_case(case: fn(&str) -> String) -> Self {
        Self {
            state_code: case("state_code"),
            city: case("city"),
            period_begin: case("period_begin"),
            period_end: case("period_end"),
            property_type: case("property_type"),
            median_sale_price: case("median_sale_price"),
            median_list_price: case("median_list_price"),
            median_ppsf: case("median_ppsf"),
            homes_sold: case("homes_sold"),
            new_listings: case("new_listings"),
            inventory: case("inventory"),
            months_of_supply: case("months_of_supply"),
            median_dom: case("median_dom"),
            avg_sale_to_list: case("avg_sale_to_list"),
            sold_above_list_pct: case("sold_above_list_pct"),
            price_drops_pct: case("price_drops_pct"),
            off_market_in_two_weeks_pct: case("off_market_in_two_weeks_pct"),
        }
    }

    pub fn lowercase() -> Self {
        Self::with_case(str::to_string)
    }

    pub fn uppercase() -> Self {
        Self::with_case(str::to_ascii_uppercase)
    }

    pub fn for_style(style: ColumnStyle) -> Self {
        match style {
            ColumnStyle::Uppercase => Self::uppercase(),
            ColumnStyle::Lowercase => Self::lowercase(),
        }
    }
}

pub struct MarketTransform {
    columns: MarketColumns,
    state_code: String,
}

impl MarketTransform {
    pub fn new(columns: MarketColumns) -> Self {
        Self {
            columns,
            state_code: STATE_CODE.to_string(),
        }
    }
}

fn field<'r>(record: &'r RawRecord, column: &str) -> &'r str {
    record.get(column).unwrap_or("").trim()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

impl FeedTransform for MarketTransform {
    type Row = MarketDataRow;

    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn admit(&self, record: &RawRecord) -> bool {
        field(record, &self.columns.state_code) == self.state_code
    }

    fn identity<'r>(&self, record: &'r RawRecord) -> Option<(KeySpace, Cow<'r, str>)> {
        record
            .get(&self.columns.city)
            .map(|city| (KeySpace::Redfin, Cow::Borrowed(city)))
    }

    fn build(&self, town: &TownId, record: &RawRecord, out: &mut Vec<MarketDataRow>) {
        let c = &self.columns;
        let Some(period_begin) = parse_date(field(record, &c.period_begin)) else {
            return;
        };
        let property_type = field(record, &c.property_type);
        if property_type.is_empty() {
            return;
        }
        let amount = |column: &str| parse_amount(field(record, column));
        let count = |column: &str| parse_count(field(record, column));
        let float = |column: &str| parse_float(field(record, column));

        out.push(MarketDataRow {
            town_id: town.clone(),
            period_begin,
            period_end: parse_date(field(record, &c.period_end)),
            property_type: property_type.to_string(),
            median_sale_price: amount(&c.median_sale_price),
            median_list_price: amount(&c.median_list_price),
            median_ppsf: amount(&c.median_ppsf),
            homes_sold: count(&c.homes_sold),
            new_listings: count(&c.new_listings),
            inventory: count(&c.inventory),
            months_of_supply: float(&c.months_of_supply),
            median_dom: count(&c.median_dom),
            avg_sale_to_list: float(&c.avg_sale_to_list),
            sold_above_list_pct: float(&c.sold_above_list_pct),
            price_drops_pct: float(&c.price_drops_pct),
            off_market_in_two_weeks_pct: float(&c.off_market_in_two_weeks_pct),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::{records, CountingResolver};
    use crate::stage::FilterDedupeStage;

    const UPPER: &[&str] = &[
        "PERIOD_BEGIN",
        "PERIOD_END",
        "STATE_CODE",
        "CITY",
        "PROPERTY_TYPE",
        "MEDIAN_SALE_PRICE",
        "HOMES_SOLD",
        "MEDIAN_DOM",
        "AVG_SALE_TO_LIST",
    ];

    fn resolver() -> CountingResolver {
        CountingResolver::new(&[("Fort Lee", "fort_lee"), ("Hoboken", "hoboken")])
    }

    #[test]
    fn column_presets_differ_only_in_case() {
        let lower = MarketColumns::lowercase();
        let upper = MarketColumns::uppercase();
        assert_eq!(lower.state_code, "state_code");
        assert_eq!(upper.state_code, "STATE_CODE");
        assert_eq!(upper.off_market_in_two_weeks_pct, "OFF_MARKET_IN_TWO_WEEKS_PCT");
        assert_eq!("lowercase".parse::<ColumnStyle>().unwrap(), ColumnStyle::Lowercase);
        assert_eq!(ColumnStyle::default(), ColumnStyle::Uppercase);
        assert!("camel".parse::<ColumnStyle>().is_err());
    }

    #[test]
    fn builds_typed_rows_from_uppercase_feed() {
        let input = records(
            UPPER,
            &[
                &["2024-01-01", "2024-01-31", "NJ", "Fort Lee", "All Residential", "650000", "41", "38", "1.012"],
                &["2024-01-01", "2024-01-31", "NY", "Albany", "All Residential", "250000", "12", "20", "0.99"],
                &["2024-01-01", "", "NJ", "Hoboken", "Condo/Co-op", "", "NA", "-1", "abc"],
            ],
        );
        let transform = MarketTransform::new(MarketColumns::uppercase());
        let resolver = resolver();
        let output = FilterDedupeStage::new(&transform, &resolver).run(input).unwrap();

        assert_eq!(output.stats.admitted, 2);
        assert_eq!(output.rows.len(), 2);
        let fort_lee = &output.rows[0];
        assert_eq!(fort_lee.town_id.as_str(), "fort_lee");
        assert_eq!(fort_lee.period_begin, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(fort_lee.period_end, NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(fort_lee.median_sale_price, Some(650000.0));
        assert_eq!(fort_lee.homes_sold, Some(41));
        assert_eq!(fort_lee.median_dom, Some(38));
        assert_eq!(fort_lee.avg_sale_to_list, Some(1.012));
        assert_eq!(fort_lee.median_list_price, None);

        let hoboken = &output.rows[1];
        assert_eq!(hoboken.period_end, None);
        assert_eq!(hoboken.median_sale_price, None);
        assert_eq!(hoboken.homes_sold, None);
        assert_eq!(hoboken.median_dom, None);
        assert_eq!(hoboken.avg_sale_to_list, None);
    }

    #[test]
    fn lowercase_preset_reads_lowercase_header() {
        let input = records(
            &["state_code", "city", "period_begin", "property_type", "inventory"],
            &[&["NJ", "Hoboken", "2023-06-01", "Townhouse", "17.0"]],
        );
        let transform = MarketTransform::new(MarketColumns::lowercase());
        let resolver = resolver();
        let output = FilterDedupeStage::new(&transform, &resolver).run(input).unwrap();
        assert_eq!(output.rows[0].inventory, Some(17));
    }

    #[test]
    fn rows_without_period_or_property_type_are_dropped() {
        let input = records(
            UPPER,
            &[
                &["", "", "NJ", "Fort Lee", "All Residential"],
                &["2024-13-01", "", "NJ", "Fort Lee", "All Residential"],
                &["2024-01-01", "", "NJ", "Fort Lee", ""],
            ],
        );
        let transform = MarketTransform::new(MarketColumns::uppercase());
        let resolver = resolver();
        let output = FilterDedupeStage::new(&transform, &resolver).run(input).unwrap();
        assert!(output.rows.is_empty());
        assert_eq!(output.stats.dropped_incomplete, 3);
        assert_eq!(output.stats.towns.len(), 1);
    }

    #[test]
    fn wrong_column_style_admits_nothing() {
        let input = records(UPPER, &[&["2024-01-01", "", "NJ", "Fort Lee", "All Residential"]]);
        let transform = MarketTransform::new(MarketColumns::lowercase());
        let resolver = resolver();
        let output = FilterDedupeStage::new(&transform, &resolver).run(input).unwrap();
        assert_eq!(output.stats.admitted, 0);
        assert_eq!(resolver.lookup_count(), 0);
    }
}
