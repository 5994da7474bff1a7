use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("SQL extraction failed: {0}")]
    Extraction(String),

    #[error("SQL syntax error: {0}")]
    Syntax(String),

    #[error("Policy violation: {0}")]
    Policy(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Generator unreachable: {0}")]
    GeneratorUnreachable(String),

    #[error("Malformed generator response: {0}")]
    MalformedResponse(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<rusqlite::Error> for QueryError {
    fn from(err: rusqlite::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("busy") || lower.contains("timed out") || lower.contains("timeout") {
            QueryError::Timeout(msg)
        } else {
            QueryError::Storage(msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
