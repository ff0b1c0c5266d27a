//! Error types at the library seams.

use thiserror::Error;

/// A rule definition that cannot be compiled.
#[derive(Debug, Error)]
pub enum RuleDefinitionError {
    #[error("invalid regex predicate '{pattern}'")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Failure inside a handler while producing a response.
///
/// These never reach subscribers as errors: the state machine folds them
/// into the abort path.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("callback handler failed")]
    Callback(#[source] anyhow::Error),
    #[error("upstream request failed")]
    Upstream(#[from] reqwest::Error),
    #[error("pass-through rule has no upstream target for origin-form request {0}")]
    MissingTarget(String),
    #[error("upstream response could not be relayed")]
    Relay(#[source] anyhow::Error),
}

/// Deliberate or peer-initiated termination of a connection without an
/// HTTP response. Returned from the hyper service so the connection is
/// torn down with no bytes written.
#[derive(Debug, Error)]
pub enum SessionClosed {
    #[error("connection closed by rule")]
    ByRule,
    #[error("request aborted")]
    Aborted,
}
