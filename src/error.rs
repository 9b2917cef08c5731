pub type TelemetryResult<T> = Result<T, TelemetryError>;
#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to read telemetry source {1}: {0}")]
    FailedToReadSourceError(std::io::Error, String),
    #[error("Serde error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Invalid telemetry record at index {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },
    #[error("Hyper error: {0}")]
    HyperError(#[from] hyper::Error),
    #[error("Invalid bind address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),
}
