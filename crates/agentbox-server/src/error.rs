use agentbox_common::LeaseError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

/// `LeaseError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub LeaseError);

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &LeaseError) -> StatusCode {
    match err {
        LeaseError::Validation(_) => StatusCode::BAD_REQUEST,
        LeaseError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        LeaseError::NotFound(_) => StatusCode::NOT_FOUND,
        LeaseError::AlreadyProvisioned { .. } | LeaseError::Conflict(_) => StatusCode::CONFLICT,
        LeaseError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        LeaseError::Runtime(_) | LeaseError::Store(_) | LeaseError::Billing(_) => {
            StatusCode::BAD_GATEWAY
        }
        LeaseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), "Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (LeaseError::Validation("x".into()), 400),
            (
                LeaseError::InsufficientBalance {
                    required: 2,
                    available: 1,
                },
                402,
            ),
            (LeaseError::NotFound("x".into()), 404),
            (
                LeaseError::AlreadyProvisioned {
                    user_id: "u".into(),
                    template_id: "t".into(),
                },
                409,
            ),
            (LeaseError::Conflict("x".into()), 409),
            (LeaseError::CapacityExceeded("x".into()), 429),
            (LeaseError::Runtime("x".into()), 502),
            (LeaseError::Store("x".into()), 502),
            (LeaseError::Billing("x".into()), 502),
            (LeaseError::Internal("x".into()), 500),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err).as_u16(), expected, "{err}");
        }
    }
}
