//! Billing provider seam
//!
//! Everything the checkout initiator and the synchronizer need from Stripe,
//! behind a trait so the live client can be swapped for a scripted one.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{CardSummary, SubscriptionStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    #[default]
    Subscription,
    Payment,
    Setup,
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Subscription => "subscription",
            CheckoutMode::Payment => "payment",
            CheckoutMode::Setup => "setup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePriceRequest {
    pub product_id: String,
    pub unit_amount_cents: i64,
    pub currency: String,
    pub nickname: String,
    /// Stable key so the same amount is never minted twice
    pub lookup_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub mode: CheckoutMode,
    /// Only honoured in subscription mode
    pub trial_period_days: Option<u32>,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSessionHandle {
    pub id: String,
    pub url: String,
}

/// The provider's view of a customer's most recent subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    /// Present only when the default payment method came back expanded
    pub payment_method: Option<CardSummary>,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Create a customer tagged with the owning user id
    async fn create_customer(&self, user_id: Uuid, email: Option<&str>) -> BillingResult<String>;

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()>;

    /// First active product with exactly this name
    async fn find_active_product(&self, name: &str) -> BillingResult<Option<String>>;

    async fn create_product(&self, name: &str, description: &str) -> BillingResult<String>;

    /// Active price carrying `lookup_key`
    async fn find_price(&self, lookup_key: &str) -> BillingResult<Option<String>>;

    async fn create_price(&self, request: &CreatePriceRequest) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionHandle>;

    /// Most recent subscription in any status, with the payment method expanded
    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>>;
}
