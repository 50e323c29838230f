use thiserror::Error;

/// Errors raised by a [`crate::gateway::Gateway`] call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to decode {table} row: {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid column identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("{table} rejected the request: {message}")]
    Rejected {
        table: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum GradebookError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("request cancelled")]
    Cancelled,

    #[error("playback speed must be a positive number, got {0}")]
    InvalidSpeed(f64),

    #[error("grade must be between 0 and 100, got {0}")]
    InvalidGrade(f64),

    #[error("points must be non-negative, got {earned} of {possible}")]
    InvalidPoints { earned: f64, possible: f64 },
}
