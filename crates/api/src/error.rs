//! API error type and its JSON rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use priceye_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    /// Provider call failed
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Upstream(_) | ApiError::Database(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::InvalidPayload(msg) => {
                ApiError::BadRequest(format!("Invalid webhook payload: {}", msg))
            }
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::Grouping(e) => ApiError::Unprocessable(e.to_string()),
            BillingError::StripeApi(msg) => ApiError::Upstream(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
