//! Error types for the DRM agent.

use thiserror::Error;

/// Errors that can occur during agent operations.
///
/// The worker thread reports every kind except [`DrmError::Exit`] through the
/// asynchronous error callback; foreground entry points return them directly.
#[derive(Debug, Error)]
pub enum DrmError {
    /// Caller or configuration supplied something invalid.
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// Malformed configuration, credentials or product JSON.
    #[error("Bad format: {0}")]
    BadFormat(String),

    /// Operation not permitted in the current licensing state.
    #[error("Bad usage: {0}")]
    BadUsage(String),

    /// Measured controller frequency deviates from the configured value by
    /// more than the detection threshold.
    #[error("Bad frequency: {0}")]
    BadFrequency(String),

    /// Hardware or driver malfunction. Fatal to the session, never retried.
    #[error("Controller error: {0}")]
    Controller(String),

    /// Terminal web service failure, including exhausted retries.
    #[error("Web service error: {0}")]
    WebService(String),

    /// Transient web service failure. Consumed by the retry engine.
    #[error("Web service temporary failure: {0}")]
    WebServiceRetryable(String),

    /// The web service answered but the response violated the contract.
    #[error("Web service response error: {0}")]
    WebServiceResponse(String),

    /// Cooperative cancellation. Never surfaced to the user.
    #[error("Exit: {0}")]
    Exit(String),
}

pub type Result<T> = std::result::Result<T, DrmError>;
