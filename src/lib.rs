use lazy_static::lazy_static;
use prometheus::register_histogram;
use prometheus::register_int_counter;
use prometheus::register_int_counter_vec;
use prometheus::register_int_gauge;
use prometheus::Histogram;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;

pub mod aggregator;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod server;

lazy_static! {
    pub static ref REQUESTS_COUNTER: IntCounterVec = register_int_counter_vec!(
        "latency_requests_total",
        "Total number of latency queries received",
        &["outcome"]
    )
    .unwrap();
    pub static ref REGIONS_MATCHED_COUNTER: IntCounter = register_int_counter!(
        "latency_regions_matched_total",
        "Total number of regions that produced statistics",
    )
    .unwrap();
    pub static ref COMPUTE_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "latency_compute_duration_seconds",
        "Time spent computing region statistics for one query",
        vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,]
    )
    .unwrap();
    pub static ref DATASET_RECORDS_GAUGE: IntGauge = register_int_gauge!(
        "telemetry_records",
        "Number of telemetry records loaded at startup",
    )
    .unwrap();
    pub static ref DATASET_REGIONS_GAUGE: IntGauge = register_int_gauge!(
        "telemetry_regions",
        "Number of distinct regions in the loaded telemetry",
    )
    .unwrap();
    pub static ref DATASET_LOAD_FAILURES_COUNTER: IntCounter = register_int_counter!(
        "telemetry_load_failures_total",
        "Number of times the telemetry source failed to load",
    )
    .unwrap();
}
