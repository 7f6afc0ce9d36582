//! Errors raised by [`HttpAuthRpc`](crate::HttpAuthRpc).
//!
//! The client orchestrator classifies failures by their text, so transport
//! errors always say `network` or `timeout` and backend rejections carry the
//! backend's own message.

use http::StatusCode;

/// Failure talking to the authentication backend.
#[derive(Debug, thiserror::Error)]
pub enum HttpRpcError {
    /// URL construction failed.
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        /// Human-readable context.
        context: &'static str,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
    /// The request did not complete within the configured timeout.
    #[error("request timeout: {context}")]
    Timeout {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The backend could not be reached.
    #[error("network error: {context}: {source}")]
    Network {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// A success response did not decode.
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        /// Human-readable context.
        context: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
    /// The backend throttled the request.
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        /// Backend message.
        message: String,
    },
    /// The backend refused the request.
    #[error("{message}")]
    Rejected {
        /// HTTP status.
        status: StatusCode,
        /// Backend message, or the raw body when it carried none.
        message: String,
    },
}

impl HttpRpcError {
    /// Classifies a transport-level reqwest error.
    pub(crate) fn transport(context: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { context, source }
        } else {
            Self::Network { context, source }
        }
    }

    /// HTTP status of a backend rejection.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            _ => None,
        }
    }
}
