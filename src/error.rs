use thiserror::Error;

/// Main error type for the VOD gateway.
///
/// Request-level failures are mapped to HTTP status codes at the handler;
/// only startup failures (bad config file, missing binaries) are fatal.
#[derive(Error, Debug)]
pub enum VodError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no video stream found in source file")]
    NoVideoStream,

    #[error("ffprobe timed out")]
    ProbeTimeout,

    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, VodError>;
