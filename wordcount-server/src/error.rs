use std::time::Duration;
use thiserror::Error;

/// Failure to construct the warehouse client at startup. Never fatal: the
/// process keeps serving `/health` and `/metrics` in degraded mode.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("could not automatically determine credentials: {0}")]
    NoCredentials(String),

    #[error("could not determine the project to bill queries to")]
    NoProject,

    #[error("failed to read credentials file '{path}': {source}")]
    CredentialsFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid credentials file '{path}': {reason}")]
    InvalidCredentials { path: String, reason: String },

    #[error("invalid BigQuery endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure of a single query execution. Surfaced to the caller as a 500.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to obtain access token: {0}")]
    Auth(String),

    #[error("request to BigQuery failed: {0}")]
    Transport(#[from] reqwest::Error),

    // Display is the service's own message so callers see it verbatim.
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("unexpected response from BigQuery: {0}")]
    Decode(String),
}
