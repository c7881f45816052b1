use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use townfeed_core::{County, RunSummary};
use townfeed_sources::census::{self, CensusTransform, DEFAULT_YEAR};
use townfeed_sources::{FilterDedupeStage, PayloadError};
use tracing::info;

use super::write_rows;
use crate::{JobContext, JobError};

#[derive(Debug, Default, Deserialize)]
struct CensusPayload {
    #[serde(default)]
    year: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct CensusSummary {
    pub year: i32,
    pub towns_fetched: usize,
    pub upserted: usize,
    pub total_server_count: u64,
    pub unmatched_fips: Vec<String>,
    pub run: RunSummary,
}

/// `{"year": 2022}` selects the survey year; anything that is not an object uses the default.
fn survey_year(payload: &JsonValue) -> Result<i32, JobError> {
    if !payload.is_object() {
        return Ok(DEFAULT_YEAR);
    }
    let payload: CensusPayload =
        serde_json::from_value(payload.clone()).map_err(PayloadError::from)?;
    Ok(payload.year.unwrap_or(DEFAULT_YEAR))
}

pub async fn run(ctx: &JobContext, payload: &JsonValue) -> Result<JsonValue> {
    let year = survey_year(payload)?;
    let source = &ctx.config.census;
    info!(year, "fetching census ACS data for {} counties", County::ALL.len());

    let mut records = Vec::new();
    for county in County::ALL {
        let fetched = census::fetch_county(&ctx.http, &source.url, year, county, source.timeout)
            .await
            .with_context(|| format!("fetching census data for {} county", county.name()))?;
        records.extend(fetched);
    }

    let transform = CensusTransform::new(year);
    let output = FilterDedupeStage::new(&transform, ctx.registry.as_ref())
        .run(census::as_feed(records))
        .context("transforming census records")?;
    info!(towns = output.rows.len(), "town demographic records built");

    let outcome = write_rows(ctx, &output.rows).await?;
    let summary = CensusSummary {
        year,
        towns_fetched: output.rows.len(),
        upserted: outcome.written,
        total_server_count: outcome.total_server_count,
        unmatched_fips: output.stats.unmatched.iter().cloned().collect(),
        run: output.stats.summary(&outcome),
    };
    Ok(serde_json::to_value(summary)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn survey_year_defaults_and_overrides() {
        assert_eq!(survey_year(&json!({})).unwrap(), 2023);
        assert_eq!(survey_year(&JsonValue::Null).unwrap(), 2023);
        assert_eq!(survey_year(&json!({"year": 2021})).unwrap(), 2021);
        assert!(matches!(
            survey_year(&json!({"year": "last"})),
            Err(JobError::InvalidPayload(_))
        ));
    }
}
