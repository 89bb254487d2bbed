//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use glimpse_core::{ErrorKind, Failure};

/// A [`Failure`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Failure);

impl ApiError {
    /// Malformed transport input: bad JSON, unreadable multipart, bad base64.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(Failure::new(ErrorKind::InvalidParameter, msg))
    }

    pub fn status(&self) -> StatusCode {
        match self.0.error_kind {
            ErrorKind::UnknownModel => StatusCode::NOT_FOUND,
            ErrorKind::FamilyMismatch | ErrorKind::InvalidMode | ErrorKind::InvalidParameter => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::LoadFailed | ErrorKind::InferenceFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.0)).into_response()
    }
}

impl From<Failure> for ApiError {
    fn from(failure: Failure) -> Self {
        Self(failure)
    }
}
