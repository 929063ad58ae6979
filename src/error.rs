//! Error taxonomy shared by the Driver, Store, Manager and Pool.
//!
//! Every variant maps 1:1 to an HTTP status at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandkastenError {
    #[error("session not found")]
    NotFound,

    #[error("session expired")]
    Expired,

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("session not running")]
    NotRunning,

    #[error("runner error: {0}")]
    RunnerError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SandkastenError {
    /// Stable `SCREAMING_SNAKE_CASE` code used in the HTTP error body
    /// (e.g. `SESSION_EXPIRED`).
    pub fn code(&self) -> &'static str {
        match self {
            SandkastenError::NotFound => "SESSION_NOT_FOUND",
            SandkastenError::Expired => "SESSION_EXPIRED",
            SandkastenError::InvalidImage(_) => "INVALID_IMAGE",
            SandkastenError::InvalidRequest(_) => "INVALID_REQUEST",
            SandkastenError::Timeout(_) => "TIMEOUT",
            SandkastenError::NotRunning => "SESSION_NOT_RUNNING",
            SandkastenError::RunnerError(_) => "RUNNER_ERROR",
            SandkastenError::Internal(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, SandkastenError>;

impl From<std::io::Error> for SandkastenError {
    fn from(e: std::io::Error) -> Self {
        SandkastenError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for SandkastenError {
    fn from(e: rusqlite::Error) -> Self {
        SandkastenError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for SandkastenError {
    fn from(e: serde_json::Error) -> Self {
        SandkastenError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_spec_scenario_names() {
        assert_eq!(SandkastenError::Expired.code(), "SESSION_EXPIRED");
        assert_eq!(SandkastenError::NotFound.code(), "SESSION_NOT_FOUND");
    }
}
