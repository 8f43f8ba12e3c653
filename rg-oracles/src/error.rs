use thiserror::Error;

pub type Result<T> = std::result::Result<T, OracleError>;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle call timed out after {0}ms")]
    Timeout(u64),

    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected oracle response: {0}")]
    ResponseFormat(String),
}

impl From<serde_json::Error> for OracleError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
