//! Stripe client configuration and the live [`BillingProvider`]

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CheckoutSessionPaymentMethodCollection, Client,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CreateCustomer, CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval,
    CreateProduct, Currency, Customer, CustomerId, Expandable, IdOrCreate, ListPrices,
    ListProducts, ListSubscriptions, Price, Product, ProductId, Subscription,
    SubscriptionStatusFilter,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{CardSummary, SubscriptionStatus};
use crate::pricing::PRICING_TIERS;
use crate::provider::{
    BillingProvider, CheckoutMode, CheckoutSessionHandle, CheckoutSessionRequest,
    CreatePriceRequest, ProviderSubscription,
};

pub const DEFAULT_PRODUCT_NAME: &str = "PricEye Main License";
pub const DEFAULT_PRODUCT_DESCRIPTION: &str =
    "Dynamic pricing platform - Main license subscription";
pub const DEFAULT_TRIAL_DAYS: u32 = 30;
pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    pub product_name: String,
    pub product_description: String,
    /// ISO currency code, lowercase
    pub currency: String,
    /// Monthly amount of the subscription price
    pub base_price_cents: i64,
    /// Pre-provisioned price; skips product/price provisioning when set
    pub price_id: Option<String>,
    pub default_trial_days: u32,
    /// Maximum age of a webhook signature timestamp
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            product_name: std::env::var("STRIPE_PRODUCT_NAME")
                .unwrap_or_else(|_| DEFAULT_PRODUCT_NAME.to_string()),
            product_description: std::env::var("STRIPE_PRODUCT_DESCRIPTION")
                .unwrap_or_else(|_| DEFAULT_PRODUCT_DESCRIPTION.to_string()),
            currency: std::env::var("STRIPE_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|_| "eur".to_string()),
            base_price_cents: parse_env("STRIPE_BASE_PRICE_CENTS", PRICING_TIERS[0].price_cents)?,
            price_id: std::env::var("STRIPE_PRICE_ID")
                .ok()
                .filter(|id| !id.is_empty()),
            default_trial_days: parse_env("STRIPE_DEFAULT_TRIAL_DAYS", DEFAULT_TRIAL_DAYS)?,
            webhook_tolerance_secs: parse_env(
                "STRIPE_WEBHOOK_TOLERANCE_SECS",
                DEFAULT_WEBHOOK_TOLERANCE_SECS,
            )?,
        })
    }

    /// Config with defaults for everything but the two secrets
    pub fn with_secrets(secret_key: &str, webhook_secret: &str) -> Self {
        Self {
            secret_key: secret_key.to_string(),
            webhook_secret: webhook_secret.to_string(),
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
            product_description: DEFAULT_PRODUCT_DESCRIPTION.to_string(),
            currency: "eur".to_string(),
            base_price_cents: PRICING_TIERS[0].price_cents,
            price_id: None,
            default_trial_days: DEFAULT_TRIAL_DAYS,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }

    /// Deterministic lookup key for the configured product, amount and currency
    pub fn price_lookup_key(&self) -> String {
        let slug: String = self
            .product_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}_{}", slug, self.base_price_cents, self.currency)
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} is not a valid number", name))),
        Err(_) => Ok(default),
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(&config.secret_key),
        }
    }
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
}

/// Rate limits, 5xx and timeouts are worth another attempt
fn is_retryable(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

fn map_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
        stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
    }
}

fn map_subscription(subscription: Subscription) -> ProviderSubscription {
    let price_id = subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    // An unexpanded id carries no card details
    let payment_method = match &subscription.default_payment_method {
        Some(Expandable::Object(method)) => Some(CardSummary {
            brand: method.card.as_ref().map(|card| card.brand.clone()),
            last4: method.card.as_ref().map(|card| card.last4.clone()),
        }),
        _ => None,
    };

    ProviderSubscription {
        id: subscription.id.to_string(),
        status: map_status(subscription.status),
        price_id,
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
        cancel_at_period_end: subscription.cancel_at_period_end,
        payment_method,
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn create_customer(&self, user_id: Uuid, email: Option<&str>) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("userId".to_string(), user_id.to_string());

        let mut params = CreateCustomer::new();
        params.email = email;
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.client, params).await?;
        tracing::info!(user_id = %user_id, customer_id = %customer.id, "Created Stripe customer");
        Ok(customer.id.to_string())
    }

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()> {
        let id = parse_customer_id(customer_id)?;
        Customer::delete(&self.client, &id).await?;
        tracing::info!(customer_id = %customer_id, "Deleted Stripe customer");
        Ok(())
    }

    async fn find_active_product(&self, name: &str) -> BillingResult<Option<String>> {
        let mut params = ListProducts::new();
        params.active = Some(true);
        params.limit = Some(10);

        let products = Product::list(&self.client, &params).await?;
        Ok(products
            .data
            .into_iter()
            .find(|product| product.name.as_deref() == Some(name))
            .map(|product| product.id.to_string()))
    }

    async fn create_product(&self, name: &str, description: &str) -> BillingResult<String> {
        let mut params = CreateProduct::new(name);
        params.description = Some(description);

        let product = Product::create(&self.client, params).await?;
        tracing::info!(product_id = %product.id, name = %name, "Created Stripe product");
        Ok(product.id.to_string())
    }

    async fn find_price(&self, lookup_key: &str) -> BillingResult<Option<String>> {
        let mut params = ListPrices::new();
        params.active = Some(true);
        params.lookup_keys = Some(vec![lookup_key.to_string()]);
        params.limit = Some(1);

        let prices = Price::list(&self.client, &params).await?;
        Ok(prices.data.into_iter().next().map(|price| price.id.to_string()))
    }

    async fn create_price(&self, request: &CreatePriceRequest) -> BillingResult<String> {
        let currency = Currency::from_str(&request.currency)
            .map_err(|_| BillingError::Config(format!("Unknown currency: {}", request.currency)))?;
        let product_id = request
            .product_id
            .parse::<ProductId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid product ID: {}", e)))?;

        let mut params = CreatePrice::new(currency);
        params.product = Some(IdOrCreate::Id(&product_id));
        params.unit_amount = Some(request.unit_amount_cents);
        params.nickname = Some(&request.nickname);
        params.lookup_key = Some(&request.lookup_key);
        params.recurring = Some(CreatePriceRecurring {
            interval: CreatePriceRecurringInterval::Month,
            ..Default::default()
        });

        let price = Price::create(&self.client, params).await?;
        tracing::info!(
            price_id = %price.id,
            lookup_key = %request.lookup_key,
            unit_amount = request.unit_amount_cents,
            "Created Stripe price"
        );
        Ok(price.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionHandle> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut params = CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.metadata = Some(request.metadata.clone());
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.mode = Some(match request.mode {
            CheckoutMode::Subscription => CheckoutSessionMode::Subscription,
            CheckoutMode::Payment => CheckoutSessionMode::Payment,
            CheckoutMode::Setup => CheckoutSessionMode::Setup,
        });

        if request.mode == CheckoutMode::Subscription {
            params.payment_method_collection = Some(CheckoutSessionPaymentMethodCollection::Always);
            if let Some(days) = request.trial_period_days {
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    trial_period_days: Some(days),
                    ..Default::default()
                });
            }
        }

        let session = CheckoutSession::create(&self.client, params).await?;
        let url = session.url.ok_or_else(|| {
            BillingError::StripeApi("Checkout session created without a URL".to_string())
        })?;

        Ok(CheckoutSessionHandle {
            id: session.id.to_string(),
            url,
        })
    }

    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let id = parse_customer_id(customer_id)?;
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(3);

        let subscriptions = RetryIf::start(
            strategy,
            || {
                let client = self.client.clone();
                let id = id.clone();
                async move {
                    let mut params = ListSubscriptions::new();
                    params.customer = Some(id);
                    params.status = Some(SubscriptionStatusFilter::All);
                    params.limit = Some(1);
                    params.expand = &["data.default_payment_method"];
                    Subscription::list(&client, &params).await
                }
            },
            |e: &stripe::StripeError| {
                let retry = is_retryable(e);
                if retry {
                    tracing::warn!(customer_id = %customer_id, error = %e, "Retrying subscription lookup");
                }
                retry
            },
        )
        .await?;

        Ok(subscriptions.data.into_iter().next().map(map_subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_lookup_key_is_stable() {
        let config = StripeConfig::with_secrets("sk_test_123", "whsec_test");
        assert_eq!(config.price_lookup_key(), "priceye_main_license_1399_eur");
    }

    #[test]
    fn test_price_lookup_key_changes_with_amount() {
        let mut config = StripeConfig::with_secrets("sk_test_123", "whsec_test");
        let before = config.price_lookup_key();
        config.base_price_cents = 1499;
        assert_ne!(before, config.price_lookup_key());
    }

    #[test]
    fn test_defaults_match_first_tier() {
        let config = StripeConfig::with_secrets("sk_test_123", "whsec_test");
        assert_eq!(config.base_price_cents, 1399);
        assert_eq!(config.default_trial_days, 30);
        assert_eq!(config.webhook_tolerance_secs, 300);
    }

    #[test]
    fn test_map_status_covers_provider_states() {
        assert_eq!(
            map_status(stripe::SubscriptionStatus::Trialing),
            SubscriptionStatus::Trialing
        );
        assert_eq!(
            map_status(stripe::SubscriptionStatus::Unpaid),
            SubscriptionStatus::Unpaid
        );
    }
}
