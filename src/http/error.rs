use axum::{
    http::{StatusCode, header},
    response::IntoResponse,
};

use crate::{codec::DecodeError, service::ServiceError};

pub type ApiResult<T> = Result<T, ApiError>;

/// An error answered with a `text/plain` body.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl ToString) -> Self {
        Self {
            status,
            detail: detail.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.detail,
        )
            .into_response()
    }
}

impl From<DecodeError> for ApiError {
    fn from(value: DecodeError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value)
    }
}

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value)
    }
}
