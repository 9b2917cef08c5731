use crate::dataset::{Dataset, RegionSeries};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

pub const UNAVAILABLE_MESSAGE: &str = "Telemetry data not available.";

const P95: f64 = 0.95;

/// Validated query body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRequest {
    pub regions: Vec<String>,
    pub threshold_ms: f64,
}

impl LatencyRequest {
    pub fn compute(
        &self,
        dataset: &Dataset,
    ) -> QueryOutcome {
        compute(dataset, &self.regions, self.threshold_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionStats {
    pub avg_latency: f64,
    pub p95_latency: f64,
    pub avg_uptime: f64,
    pub breaches: u64,
}

impl RegionStats {
    fn from_series(
        series: &RegionSeries,
        threshold_ms: f64,
    ) -> Self {
        let mut sorted = series.latency_ms.clone();
        sorted.sort_by(f64::total_cmp);

        RegionStats {
            avg_latency: round_half_even(mean(&series.latency_ms), 2),
            p95_latency: round_half_even(percentile(&sorted, P95), 2),
            avg_uptime: round_half_even(mean(&series.uptime_pct), 4),
            breaches: series
                .latency_ms
                .iter()
                .filter(|latency| **latency > threshold_ms)
                .count() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutcome {
    Stats(BTreeMap<String, RegionStats>),
    Unavailable { error: &'static str },
}

impl QueryOutcome {
    pub fn unavailable() -> Self {
        QueryOutcome::Unavailable {
            error: UNAVAILABLE_MESSAGE,
        }
    }

    pub fn stats(&self) -> Option<&BTreeMap<String, RegionStats>> {
        match self {
            QueryOutcome::Stats(stats) => Some(stats),
            QueryOutcome::Unavailable { .. } => None,
        }
    }

    pub fn get(
        &self,
        region: &str,
    ) -> Option<&RegionStats> {
        self.stats().and_then(|stats| stats.get(region))
    }
}

/// Per region statistics for every requested region that has at least one record.
///
/// Regions without records are left out of the result. Repeating a region
/// yields the same entry. An unavailable dataset short-circuits the whole call.
#[instrument(level = "debug", skip(dataset, regions), fields(regions = regions.len()))]
pub fn compute(
    dataset: &Dataset,
    regions: &[String],
    threshold_ms: f64,
) -> QueryOutcome {
    if !dataset.is_available() {
        debug!("dataset unavailable, returning degraded response");
        return QueryOutcome::unavailable();
    }

    let mut results = BTreeMap::new();
    for region in regions {
        let Some(series) = dataset.region(region) else {
            continue;
        };
        results.insert(region.clone(), RegionStats::from_series(series, threshold_ms));
    }
    debug!("computed stats for {} of {} regions", results.len(), regions.len());

    QueryOutcome::Stats(results)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Quantile `q` of ascending `sorted` values, interpolating linearly between
/// the two closest ranks around `q * (n - 1)`.
pub fn percentile(
    sorted: &[f64],
    q: f64,
) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let fraction = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}

/// Round to `decimals` places, ties to even.
pub fn round_half_even(
    value: f64,
    decimals: i32,
) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round_ties_even() / factor
}
