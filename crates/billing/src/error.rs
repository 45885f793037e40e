//! Billing error types

use thiserror::Error;

use crate::grouping::GroupingError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Grouping(#[from] GroupingError),
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}
