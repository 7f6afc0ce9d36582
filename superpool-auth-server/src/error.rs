//! HTTP error responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use superpool_auth_evm::AuthServiceError;

/// Errors returned by the route handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The request body is not valid JSON for the endpoint.
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    /// The verifier refused the request.
    #[error(transparent)]
    Auth(#[from] AuthServiceError),
}

impl ServerError {
    /// Status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::Auth(e) => match e {
                AuthServiceError::InvalidAddress(_)
                | AuthServiceError::NonceMismatch(_)
                | AuthServiceError::MessageMismatch => StatusCode::BAD_REQUEST,
                AuthServiceError::NonceNotFound => StatusCode::NOT_FOUND,
                AuthServiceError::Expired
                | AuthServiceError::InvalidSignature(_)
                | AuthServiceError::InvalidToken
                | AuthServiceError::SafeVerificationFailed { .. } => StatusCode::UNAUTHORIZED,
                AuthServiceError::TokenIssue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, %status, "Request rejected");
        }
        let mut body = serde_json::json!({ "error": self.to_string() });
        if let Self::Auth(AuthServiceError::SafeVerificationFailed {
            code: Some(code), ..
        }) = &self
        {
            body["code"] = code.as_code().into();
        }
        (status, axum::Json(body)).into_response()
    }
}
