//! Stripe Checkout sessions

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingProvider, CheckoutMode, CheckoutSessionRequest, CreatePriceRequest};
use crate::store::BillingStore;

const PRICE_NICKNAME: &str = "Main License - Trial Setup";

/// The authenticated caller starting a checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutUser {
    pub id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub mode: Option<CheckoutMode>,
    #[serde(default)]
    pub trial_period_days: Option<u32>,
    /// Missing URLs deserialize empty and fail validation with a 400
    #[serde(default)]
    pub success_url: String,
    #[serde(default)]
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub url: String,
}

/// Product and price settings checkout provisions against
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub product_name: String,
    pub product_description: String,
    pub currency: String,
    pub base_price_cents: i64,
    pub price_id: Option<String>,
    pub price_lookup_key: String,
    pub default_trial_days: u32,
}

impl From<&StripeConfig> for CheckoutConfig {
    fn from(config: &StripeConfig) -> Self {
        Self {
            product_name: config.product_name.clone(),
            product_description: config.product_description.clone(),
            currency: config.currency.clone(),
            base_price_cents: config.base_price_cents,
            price_id: config.price_id.clone(),
            price_lookup_key: config.price_lookup_key(),
            default_trial_days: config.default_trial_days,
        }
    }
}

/// Checkout service for creating Stripe checkout sessions
#[derive(Clone)]
pub struct CheckoutService {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
    config: CheckoutConfig,
}

impl CheckoutService {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Open a hosted checkout session for an authenticated user
    ///
    /// Ensures, in order: the customer mapping, the priced product, and a
    /// `not_started` subscription row, then creates the session. Remote
    /// objects created here may outlive an abandoned checkout.
    pub async fn create_checkout(
        &self,
        user: &CheckoutUser,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        if request.success_url.trim().is_empty() || request.cancel_url.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "success_url and cancel_url are required".to_string(),
            ));
        }

        let customer_id = self.ensure_customer(user).await?;
        let price_id = self.ensure_price().await?;

        if self
            .store
            .ensure_subscription_placeholder(&customer_id)
            .await?
        {
            tracing::info!(customer_id = %customer_id, "Created placeholder subscription record");
        }

        let mode = request.mode.unwrap_or_default();
        let trial_period_days = match mode {
            // Zero means "use the default"; Stripe rejects a zero-day trial
            CheckoutMode::Subscription => Some(
                request
                    .trial_period_days
                    .filter(|days| *days > 0)
                    .unwrap_or(self.config.default_trial_days),
            ),
            _ => None,
        };

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user.id.to_string());
        metadata.insert("trial_setup".to_string(), "true".to_string());

        let session = self
            .provider
            .create_checkout_session(&CheckoutSessionRequest {
                customer_id: customer_id.clone(),
                price_id,
                mode,
                trial_period_days,
                success_url: request.success_url.clone(),
                cancel_url: request.cancel_url.clone(),
                metadata,
            })
            .await?;

        tracing::info!(
            user_id = %user.id,
            customer_id = %customer_id,
            session_id = %session.id,
            mode = mode.as_str(),
            trial_period_days = ?trial_period_days,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id,
            url: session.url,
        })
    }

    /// Live customer id for the user, creating the customer on first use
    ///
    /// If the mapping cannot be saved the new remote customer is deleted
    /// again. When the save failed because a concurrent request already
    /// mapped the user, that request's customer is used.
    pub async fn ensure_customer(&self, user: &CheckoutUser) -> BillingResult<String> {
        if let Some(mapping) = self.store.find_customer_mapping(user.id).await? {
            return Ok(mapping.customer_id);
        }

        let customer_id = self
            .provider
            .create_customer(user.id, user.email.as_deref())
            .await?;

        let save_error = match self
            .store
            .insert_customer_mapping(user.id, &customer_id)
            .await
        {
            Ok(mapping) => {
                tracing::info!(user_id = %user.id, customer_id = %mapping.customer_id, "Saved customer mapping");
                return Ok(mapping.customer_id);
            }
            Err(e) => e,
        };

        tracing::error!(
            user_id = %user.id,
            customer_id = %customer_id,
            error = %save_error,
            "Failed to save customer mapping, deleting Stripe customer"
        );
        if let Err(e) = self.provider.delete_customer(&customer_id).await {
            tracing::error!(
                customer_id = %customer_id,
                error = %e,
                "Failed to delete orphaned Stripe customer"
            );
        }

        match self.store.find_customer_mapping(user.id).await {
            Ok(Some(winner)) => {
                tracing::info!(
                    user_id = %user.id,
                    customer_id = %winner.customer_id,
                    "Using customer mapped by a concurrent checkout"
                );
                Ok(winner.customer_id)
            }
            _ => Err(save_error),
        }
    }

    /// Price id to put on the session
    ///
    /// A configured price is used as-is. Otherwise the price is looked up by
    /// its lookup key and only created when missing, under the product found
    /// (or created) by name.
    pub async fn ensure_price(&self) -> BillingResult<String> {
        if let Some(price_id) = &self.config.price_id {
            return Ok(price_id.clone());
        }

        let product_id = match self
            .provider
            .find_active_product(&self.config.product_name)
            .await?
        {
            Some(id) => id,
            None => {
                self.provider
                    .create_product(&self.config.product_name, &self.config.product_description)
                    .await?
            }
        };

        if let Some(price_id) = self
            .provider
            .find_price(&self.config.price_lookup_key)
            .await?
        {
            return Ok(price_id);
        }

        self.provider
            .create_price(&CreatePriceRequest {
                product_id,
                unit_amount_cents: self.config.base_price_cents,
                currency: self.config.currency.clone(),
                nickname: PRICE_NICKNAME.to_string(),
                lookup_key: self.config.price_lookup_key.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryBillingStore, MockBillingProvider};
    use crate::models::SubscriptionStatus;

    fn config() -> CheckoutConfig {
        CheckoutConfig::from(&StripeConfig::with_secrets("sk_test_123", "whsec_test"))
    }

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            mode: None,
            trial_period_days: None,
            success_url: "https://app.priceye.test/onboarding?step=5".to_string(),
            cancel_url: "https://app.priceye.test/onboarding?step=4".to_string(),
        }
    }

    fn user() -> CheckoutUser {
        CheckoutUser {
            id: Uuid::new_v4(),
            email: Some("owner@example.com".to_string()),
        }
    }

    fn service(
        provider: &Arc<MockBillingProvider>,
        store: &Arc<InMemoryBillingStore>,
        config: CheckoutConfig,
    ) -> CheckoutService {
        CheckoutService::new(provider.clone(), store.clone(), config)
    }

    #[tokio::test]
    async fn test_first_checkout_provisions_everything() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let checkout = service(&provider, &store, config());
        let user = user();

        let response = checkout.create_checkout(&user, &request()).await.unwrap();
        assert!(response.url.starts_with("https://checkout.stripe.com/"));

        let customers = provider.created_customers().await;
        assert_eq!(customers.len(), 1);
        let mapping = store.find_customer_mapping(user.id).await.unwrap().unwrap();
        assert_eq!(mapping.customer_id, customers[0]);

        let placeholder = store.subscription(&customers[0]).await.unwrap();
        assert_eq!(placeholder.status, SubscriptionStatus::NotStarted);
        assert_eq!(placeholder.updated_at, time::OffsetDateTime::UNIX_EPOCH);

        let prices = provider.created_prices().await;
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].unit_amount_cents, 1399);
        assert_eq!(prices[0].nickname, "Main License - Trial Setup");

        let sessions = provider.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].mode, CheckoutMode::Subscription);
        assert_eq!(sessions[0].trial_period_days, Some(30));
        assert_eq!(
            sessions[0].metadata.get("user_id"),
            Some(&user.id.to_string())
        );
        assert_eq!(
            sessions[0].metadata.get("trial_setup").map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_repeat_checkout_reuses_customer_and_price() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let checkout = service(&provider, &store, config());
        let user = user();

        checkout.create_checkout(&user, &request()).await.unwrap();
        checkout.create_checkout(&user, &request()).await.unwrap();

        assert_eq!(provider.created_customers().await.len(), 1);
        assert_eq!(provider.created_prices().await.len(), 1);
        assert_eq!(provider.product_count().await, 1);
        assert_eq!(provider.sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_existing_price_found_by_lookup_key() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let config = config();
        let product = provider.seed_product(&config.product_name).await;
        let price = provider.seed_price(&product, &config.price_lookup_key).await;

        let checkout = service(&provider, &store, config);
        checkout.create_checkout(&user(), &request()).await.unwrap();

        assert!(provider.created_prices().await.iter().all(|p| p.nickname == "seeded"));
        assert_eq!(provider.sessions().await[0].price_id, price);
    }

    #[tokio::test]
    async fn test_configured_price_id_skips_provisioning() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let mut config = config();
        config.price_id = Some("price_fixed".to_string());

        let checkout = service(&provider, &store, config);
        checkout.create_checkout(&user(), &request()).await.unwrap();

        assert_eq!(provider.product_count().await, 0);
        assert!(provider.created_prices().await.is_empty());
        assert_eq!(provider.sessions().await[0].price_id, "price_fixed");
    }

    #[tokio::test]
    async fn test_explicit_trial_and_payment_mode() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let checkout = service(&provider, &store, config());

        let mut with_trial = request();
        with_trial.trial_period_days = Some(14);
        checkout.create_checkout(&user(), &with_trial).await.unwrap();

        let mut payment = request();
        payment.mode = Some(CheckoutMode::Payment);
        payment.trial_period_days = Some(14);
        checkout.create_checkout(&user(), &payment).await.unwrap();

        let sessions = provider.sessions().await;
        assert_eq!(sessions[0].trial_period_days, Some(14));
        assert_eq!(sessions[1].mode, CheckoutMode::Payment);
        assert_eq!(sessions[1].trial_period_days, None);
    }

    #[tokio::test]
    async fn test_zero_trial_days_uses_default() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let checkout = service(&provider, &store, config());

        let mut zero = request();
        zero.trial_period_days = Some(0);
        checkout.create_checkout(&user(), &zero).await.unwrap();

        let sessions = provider.sessions().await;
        assert_eq!(sessions[0].trial_period_days, Some(config().default_trial_days));
    }

    #[tokio::test]
    async fn test_missing_urls_rejected_before_provider_calls() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let checkout = service(&provider, &store, config());

        let mut bad = request();
        bad.cancel_url = "  ".to_string();
        let err = checkout.create_checkout(&user(), &bad).await.unwrap_err();

        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(provider.created_customers().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_mapping_deletes_remote_customer() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        store.fail_next_mapping_insert().await;
        let checkout = service(&provider, &store, config());

        let err = checkout.create_checkout(&user(), &request()).await.unwrap_err();

        assert!(matches!(err, BillingError::Database(_)));
        assert_eq!(
            provider.deleted_customers().await,
            provider.created_customers().await
        );
        assert!(provider.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_lost_mapping_race_uses_winner() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        store.lose_next_mapping_race("cus_winner").await;
        let checkout = service(&provider, &store, config());
        let user = user();

        checkout.create_checkout(&user, &request()).await.unwrap();

        let created = provider.created_customers().await;
        assert_eq!(provider.deleted_customers().await, created);
        assert_eq!(provider.sessions().await[0].customer_id, "cus_winner");
        let live: Vec<_> = store
            .mappings()
            .await
            .into_iter()
            .filter(|m| m.user_id == user.id && m.is_live())
            .collect();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_session_failure_keeps_customer_mapping() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        provider.fail_checkout_sessions(true).await;
        let checkout = service(&provider, &store, config());
        let user = user();

        let err = checkout.create_checkout(&user, &request()).await.unwrap_err();
        assert!(matches!(err, BillingError::StripeApi(_)));
        assert!(store.find_customer_mapping(user.id).await.unwrap().is_some());
        assert!(provider.deleted_customers().await.is_empty());
    }

    #[test]
    fn test_response_uses_session_id_key() {
        let json = serde_json::to_value(CheckoutResponse {
            session_id: "cs_test_1".to_string(),
            url: "https://checkout.stripe.com/c/pay/cs_test_1".to_string(),
        })
        .unwrap();
        assert_eq!(json["sessionId"], "cs_test_1");
    }
}
