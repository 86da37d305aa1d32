//! CloudControl client errors

use thiserror::Error;

/// Response code CloudControl returns when paging past the end of a tag
/// listing. Callers treat it as end-of-stream rather than a failure.
pub const UNEXPECTED_ERROR: &str = "UNEXPECTED_ERROR";

/// Errors that can occur when talking to the CloudControl API
#[derive(Debug, Error)]
pub enum ComputeError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// CloudControl returned an API-level error response
    #[error("CloudControl API error {code}: {message}")]
    Api { code: String, message: String },

    /// JSON decoding error
    #[error("error decoding response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// Entity lookup returned no result
    #[error("not found: {0}")]
    NotFound(String),
}

impl ComputeError {
    /// Whether this is the provider's spurious past-the-end paging error.
    pub fn is_end_of_pages(&self) -> bool {
        matches!(self, ComputeError::Api { code, .. } if code == UNEXPECTED_ERROR)
    }
}
