//! Raw cell coercion under the shared "missing data" convention.
//!
//! Every parser returns `None` instead of failing: empty cells, sentinel
//! tokens (`NA`, `.`), Census annotation values (`-666666666` and the other
//! large negative codes) and unparseable text are all absent values.

/// Census annotation codes are all at or below this value.
const SENTINEL_FLOOR: f64 = -666_666_666.0;

const SENTINEL_TOKENS: &[&str] = &["NA", "."];

fn clean(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || SENTINEL_TOKENS.contains(&trimmed) {
        None
    } else {
        Some(trimmed)
    }
}

fn not_sentinel(value: f64) -> bool {
    value.is_finite() && value > SENTINEL_FLOOR
}

pub fn parse_float(raw: &str) -> Option<f64> {
    let value: f64 = clean(raw)?.parse().ok()?;
    not_sentinel(value).then_some(value)
}

/// Integers also accept integral floats (`"12.0"`); fractional values are truncated.
pub fn parse_int(raw: &str) -> Option<i64> {
    let text = clean(raw)?;
    if let Ok(value) = text.parse::<i64>() {
        return not_sentinel(value as f64).then_some(value);
    }
    let value = parse_float(text)?;
    if value.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(value.trunc() as i64)
}

/// Counts (population, homes sold) are never negative; a negative value is a data-quality signal.
pub fn parse_count(raw: &str) -> Option<i64> {
    parse_int(raw).filter(|v| *v >= 0)
}

/// Monetary and other inherently non-negative measures.
pub fn parse_amount(raw: &str) -> Option<f64> {
    parse_float(raw).filter(|v| *v >= 0.0)
}

/// Round to the single decimal place used by every derived metric.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// `part / total * 100`, absent when an input is absent or the total is not positive.
pub fn percent_of(part: Option<i64>, total: Option<i64>) -> Option<f64> {
    let total = total.filter(|t| *t > 0)?;
    let part = part?;
    Some(round1(part as f64 / total as f64 * 100.0))
}

/// Share of `total` not covered by the known components, in percent.
///
/// Absent components are skipped. The result is negative when the component
/// estimates exceed the total and is emitted unclamped.
pub fn residual_percent(total: Option<i64>, components: &[Option<i64>]) -> Option<f64> {
    let total = total.filter(|t| *t > 0)?;
    let known: i64 = components.iter().flatten().sum();
    Some(round1((total - known) as f64 / total as f64 * 100.0))
}

/// Average of an aggregate over a count, e.g. total travel minutes per commuter.
pub fn ratio(aggregate: Option<f64>, count: Option<i64>) -> Option<f64> {
    let count = count.filter(|c| *c > 0)?;
    let aggregate = aggregate?;
    Some(round1(aggregate / count as f64))
}
