use thiserror::Error;

/// Errors raised by the approximate query engine.
///
/// Approximate-path failures (`Configuration` through `Cancelled`) are
/// recoverable: the engine downgrades the query to exact execution. Exact
/// execution failures (`Parse`, `Unsupported`, `NotFound`, `Storage`) reach
/// the caller unchanged.
#[derive(Debug, Error)]
pub enum AqeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("sketch shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid sample fraction {0}: must be in (0, 1]")]
    InvalidFraction(f64),
    #[error("sample fraction {0} gives no reduction over a full scan")]
    NoSamplingBenefit(f64),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("query timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("SQL parse error: {0}")]
    Parse(String),
    #[error("unsupported query: {0}")]
    Unsupported(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("history error: {0}")]
    History(String),
    #[error("io: {0}")]
    Io(String),
}

impl From<std::io::Error> for AqeError {
    fn from(e: std::io::Error) -> Self {
        AqeError::Io(e.to_string())
    }
}

impl From<arrow_schema::ArrowError> for AqeError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        AqeError::Storage(format!("arrow: {e}"))
    }
}
