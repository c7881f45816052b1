//! Manually supplied municipal tax rates.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use townfeed_core::{KeySpace, TaxRateRow, TownId, TownResolver};
use tracing::warn;

use crate::stage::RowSet;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing '{0}' in payload")]
    MissingField(&'static str),
    #[error("payload must contain 'rates' or 'rates_by_name'")]
    MissingRates,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaxRateValues {
    pub general_tax_rate: Option<f64>,
    pub effective_tax_rate: Option<f64>,
    pub equalization_ratio: Option<f64>,
    pub avg_residential_tax: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaxRateEntry {
    pub town_id: Option<String>,
    #[serde(flatten)]
    pub values: TaxRateValues,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaxRatePayload {
    pub year: Option<i32>,
    pub rates: Option<Vec<TaxRateEntry>>,
    pub rates_by_name: Option<BTreeMap<String, TaxRateValues>>,
}

impl TaxRatePayload {
    pub fn from_value(value: JsonValue) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_value(value)?;
        match payload.year {
            None | Some(0) => return Err(PayloadError::MissingField("year")),
            Some(_) => {}
        }
        if payload.rates.is_none() && payload.rates_by_name.is_none() {
            return Err(PayloadError::MissingRates);
        }
        Ok(payload)
    }
}

#[derive(Debug)]
pub struct TaxRateBatch {
    pub year: i32,
    pub rows: Vec<TaxRateRow>,
    pub unmatched: Vec<String>,
}

fn row(town_id: &TownId, year: i32, values: &TaxRateValues) -> TaxRateRow {
    TaxRateRow {
        town_id: town_id.clone(),
        year,
        general_tax_rate: values.general_tax_rate,
        effective_tax_rate: values.effective_tax_rate,
        equalization_ratio: values.equalization_ratio,
        avg_residential_tax: values.avg_residential_tax,
    }
}

/// Resolve payload entries to rows. `rates` takes precedence over `rates_by_name`.
/// Unknown towns are logged and reported, never fatal.
pub fn build_rows<R>(payload: &TaxRatePayload, resolver: &R) -> Result<TaxRateBatch, PayloadError>
where
    R: TownResolver + ?Sized,
{
    let year = payload.year.ok_or(PayloadError::MissingField("year"))?;
    let mut rows = RowSet::new();
    let mut unmatched = Vec::new();

    if let Some(entries) = &payload.rates {
        for entry in entries {
            let town_id = entry.town_id.as_deref().unwrap_or("").trim();
            if !resolver.knows(town_id) {
                warn!(town_id, "unknown town_id, skipping");
                unmatched.push(town_id.to_string());
                continue;
            }
            rows.insert(row(&TownId::new(town_id), year, &entry.values));
        }
    } else if let Some(by_name) = &payload.rates_by_name {
        for (name, values) in by_name {
            let Some(town_id) = resolver.resolve(KeySpace::Name, name) else {
                warn!(name = %name, "unknown town name, skipping");
                unmatched.push(name.clone());
                continue;
            };
            rows.insert(row(town_id, year, values));
        }
    } else {
        return Err(PayloadError::MissingRates);
    }

    unmatched.sort();
    unmatched.dedup();
    Ok(TaxRateBatch {
        year,
        rows: rows.into_rows(),
        unmatched,
    })
}
