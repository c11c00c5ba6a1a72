use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::Error;

/// Error payload shared by JSON responses and SSE `error` events.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    pub retryable: bool,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
            retryable: err.is_retryable(),
        }
    }
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::Embedding(_) | Error::Generation(_) | Error::Storage { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (status_for(&self), Json(ErrorBody::from(&self))).into_response()
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::invalid(rejection.body_text())
    }
}
