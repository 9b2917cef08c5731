use crate::error::TelemetryError::{FailedToReadSourceError, InvalidRecord};
use crate::error::TelemetryResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

/// One observation from the telemetry source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub region: String,
    pub latency_ms: f64,
    pub uptime_pct: f64,
}

/// Column values of every record sharing one region, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionSeries {
    pub latency_ms: Vec<f64>,
    pub uptime_pct: Vec<f64>,
}

impl RegionSeries {
    pub fn is_empty(&self) -> bool {
        self.latency_ms.is_empty()
    }
}

/// The telemetry table, loaded once and never mutated afterwards.
///
/// `Unavailable` marks a source that failed to load. It is not the same
/// thing as a loaded table with no rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Dataset {
    Unavailable,
    Loaded {
        series: HashMap<String, RegionSeries>,
        record_count: usize,
    },
}

impl Dataset {
    pub fn from_records(records: Vec<TelemetryRecord>) -> Self {
        let record_count = records.len();
        let mut series: HashMap<String, RegionSeries> = HashMap::new();
        for record in records {
            let column = series.entry(record.region).or_default();
            column.latency_ms.push(record.latency_ms);
            column.uptime_pct.push(record.uptime_pct);
        }
        Dataset::Loaded {
            series,
            record_count,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Dataset::Loaded { .. })
    }

    pub fn record_count(&self) -> usize {
        match self {
            Dataset::Unavailable => 0,
            Dataset::Loaded { record_count, .. } => *record_count,
        }
    }

    pub fn region_count(&self) -> usize {
        match self {
            Dataset::Unavailable => 0,
            Dataset::Loaded { series, .. } => series.len(),
        }
    }

    /// Exact, case sensitive lookup. `None` when the region has no records
    /// or the dataset is unavailable.
    pub fn region(
        &self,
        region: &str,
    ) -> Option<&RegionSeries> {
        match self {
            Dataset::Unavailable => None,
            Dataset::Loaded { series, .. } => series.get(region).filter(|s| !s.is_empty()),
        }
    }
}

/// Load the telemetry table, falling back to [`Dataset::Unavailable`] on any failure.
///
/// Failures are logged but never returned, so the caller can keep
/// serving degraded responses instead of refusing to start.
pub fn load(path: impl AsRef<Path>) -> Dataset {
    let path = path.as_ref();
    match try_load(path) {
        Ok(dataset) => {
            info!(
                "Loaded {} telemetry records across {} regions from {}",
                dataset.record_count(),
                dataset.region_count(),
                path.display()
            );
            dataset
        }
        Err(e) => {
            error!("Error loading data: {}", e);
            Dataset::Unavailable
        }
    }
}

pub fn try_load(path: impl AsRef<Path>) -> TelemetryResult<Dataset> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|e| FailedToReadSourceError(e, path.display().to_string()))?;
    let records = parse_records(&bytes)?;
    Ok(Dataset::from_records(records))
}

/// Parse a JSON array of records and reject any record that would corrupt the statistics.
pub fn parse_records(bytes: &[u8]) -> TelemetryResult<Vec<TelemetryRecord>> {
    let records: Vec<TelemetryRecord> = serde_json::from_slice(bytes)?;
    for (index, record) in records.iter().enumerate() {
        validate_record(index, record)?;
    }
    Ok(records)
}

fn validate_record(
    index: usize,
    record: &TelemetryRecord,
) -> TelemetryResult<()> {
    if !record.latency_ms.is_finite() {
        return Err(InvalidRecord {
            index,
            reason: format!("latency_ms is not finite: {}", record.latency_ms),
        });
    }
    if record.latency_ms < 0.0 {
        return Err(InvalidRecord {
            index,
            reason: format!("latency_ms is negative: {}", record.latency_ms),
        });
    }
    if !record.uptime_pct.is_finite() {
        return Err(InvalidRecord {
            index,
            reason: format!("uptime_pct is not finite: {}", record.uptime_pct),
        });
    }
    if !(0.0..=100.0).contains(&record.uptime_pct) {
        warn!(
            "Record {} in region {} has uptime_pct {} outside [0, 100]",
            index, record.region, record.uptime_pct
        );
    }
    Ok(())
}
