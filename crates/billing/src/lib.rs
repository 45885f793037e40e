// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider error text
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PricEye Billing Module
//!
//! Reconciles Stripe subscriptions with the application's own records.
//!
//! ## Features
//!
//! - **Tiered Pricing**: Position-based tier table plus a flat rate for grouped units
//! - **Property Grouping**: Units at the same address share one tier position
//! - **Checkout**: One Stripe customer per user, idempotent price provisioning
//! - **Webhooks**: Signature verification and event classification
//! - **Synchronization**: Provider re-reads mirrored locally and projected onto profiles
//! - **Invariants**: SQL consistency checks for the reconciliation worker

pub mod checkout;
pub mod client;
pub mod error;
pub mod grouping;
pub mod invariants;
pub mod models;
pub mod pricing;
pub mod properties;
pub mod provider;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{
    CheckoutConfig, CheckoutRequest, CheckoutResponse, CheckoutService, CheckoutUser,
};

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Grouping
pub use grouping::{
    address_hash, normalize_address, resolve_groups, GroupingError, GroupingResult,
    PropertyAssignment,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    BillingStatus, CardSummary, CustomerMapping, Profile, ProfilePatch, Property,
    SubscriptionRecord, SubscriptionSnapshot, SubscriptionStatus, UserBillingProjection,
    UserSubscriptionStatus,
};

// Pricing
pub use pricing::{
    calculate_hybrid_pricing, tier_price, BreakdownKind, BreakdownLine, HybridPricing,
    PricedUnit, PricingTier, TierBound, FLAT_CHILD_PRICE_CENTS, PRICING_TIERS,
};

// Properties
pub use properties::{PropertyPricing, PropertyPricingService};

// Provider
pub use provider::{
    BillingProvider, CheckoutMode, CheckoutSessionHandle, CheckoutSessionRequest,
    CreatePriceRequest, ProviderSubscription,
};

// Store
pub use store::{BillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{
    project_status, ReconcileFailure, ReconcileSummary, SubscriptionSynchronizer,
    SubscriptionView, SyncOutcome,
};

// Webhooks
pub use webhooks::{
    classify_event, verify_signature, WebhookAction, WebhookEvent, WebhookHandler,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub checkout: CheckoutService,
    pub properties: PropertyPricingService,
    pub synchronizer: SubscriptionSynchronizer,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::with_pool(config, pool))
    }

    /// Live Stripe client over the Postgres store
    pub fn with_pool(config: StripeConfig, pool: PgPool) -> Self {
        let provider: Arc<dyn BillingProvider> = Arc::new(StripeClient::new(&config));
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        Self::new(config, provider, store)
    }

    /// Create a new billing service with explicit seams
    pub fn new(
        config: StripeConfig,
        provider: Arc<dyn BillingProvider>,
        store: Arc<dyn BillingStore>,
    ) -> Self {
        let synchronizer = SubscriptionSynchronizer::new(provider.clone(), store.clone());

        Self {
            checkout: CheckoutService::new(
                provider,
                store.clone(),
                CheckoutConfig::from(&config),
            ),
            properties: PropertyPricingService::new(store),
            webhooks: WebhookHandler::new(
                config.webhook_secret.clone(),
                config.webhook_tolerance_secs,
                synchronizer.clone(),
            ),
            synchronizer,
        }
    }
}
