//! In-memory fakes for the provider and store seams
//!
//! `InMemoryBillingStore` follows the Postgres store's rules: one live
//! mapping per user, ordered subscription upserts, epoch-stamped
//! placeholders and card details kept when a read carries none.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::grouping::PropertyAssignment;
use crate::models::{
    BillingStatus, CustomerMapping, Profile, ProfilePatch, Property, SubscriptionRecord,
    SubscriptionSnapshot, SubscriptionStatus, UserBillingProjection, UserSubscriptionStatus,
};
use crate::provider::{
    BillingProvider, CheckoutSessionHandle, CheckoutSessionRequest, CreatePriceRequest,
    ProviderSubscription,
};
use crate::store::BillingStore;

#[derive(Default)]
struct StoreState {
    mappings: Vec<CustomerMapping>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    profiles: HashMap<Uuid, Profile>,
    users: HashMap<Uuid, UserBillingProjection>,
    properties: Vec<Property>,
    profile_writes: usize,
    fail_next_mapping_insert: bool,
    /// Customer a concurrent request maps first on the next insert
    race_winner: Option<String>,
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<StoreState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profile and user rows in their initial state
    pub async fn seed_user(&self, user_id: Uuid) {
        let mut state = self.state.lock().await;
        state.profiles.insert(
            user_id,
            Profile {
                id: user_id,
                full_name: None,
                company_name: None,
                billing_status: BillingStatus::Pending,
                onboarding_completed: false,
            },
        );
        state.users.insert(
            user_id,
            UserBillingProjection {
                id: user_id,
                stripe_customer_id: None,
                stripe_subscription_id: None,
                subscription_status: UserSubscriptionStatus::None,
            },
        );
    }

    pub async fn seed_mapping(&self, user_id: Uuid, customer_id: &str) {
        self.state.lock().await.mappings.push(CustomerMapping {
            user_id,
            customer_id: customer_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        });
    }

    pub async fn soft_delete_mapping(&self, customer_id: &str) {
        let mut state = self.state.lock().await;
        for mapping in state.mappings.iter_mut() {
            if mapping.customer_id == customer_id && mapping.is_live() {
                mapping.deleted_at = Some(OffsetDateTime::now_utc());
            }
        }
    }

    pub async fn seed_subscription(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(record.customer_id.clone(), record);
    }

    pub async fn seed_property(&self, property: Property) {
        self.state.lock().await.properties.push(property);
    }

    /// Make the next mapping insert fail as a database error would
    pub async fn fail_next_mapping_insert(&self) {
        self.state.lock().await.fail_next_mapping_insert = true;
    }

    /// Make the next mapping insert lose to a concurrent request that maps
    /// the same user to `winner_customer_id`
    pub async fn lose_next_mapping_race(&self, winner_customer_id: &str) {
        self.state.lock().await.race_winner = Some(winner_customer_id.to_string());
    }

    pub async fn subscription(&self, customer_id: &str) -> Option<SubscriptionRecord> {
        self.state.lock().await.subscriptions.get(customer_id).cloned()
    }

    pub async fn profile(&self, user_id: Uuid) -> Option<Profile> {
        self.state.lock().await.profiles.get(&user_id).cloned()
    }

    pub async fn user(&self, user_id: Uuid) -> Option<UserBillingProjection> {
        self.state.lock().await.users.get(&user_id).cloned()
    }

    pub async fn mappings(&self) -> Vec<CustomerMapping> {
        self.state.lock().await.mappings.clone()
    }

    pub async fn property(&self, property_id: Uuid) -> Option<Property> {
        self.state
            .lock()
            .await
            .properties
            .iter()
            .find(|p| p.id == property_id)
            .cloned()
    }

    /// Non-empty profile updates that hit a row
    pub async fn profile_writes(&self) -> usize {
        self.state.lock().await.profile_writes
    }
}

fn live_mapping(state: &StoreState, user_id: Uuid) -> Option<&CustomerMapping> {
    state
        .mappings
        .iter()
        .find(|m| m.user_id == user_id && m.is_live())
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_customer_mapping(&self, user_id: Uuid) -> BillingResult<Option<CustomerMapping>> {
        let state = self.state.lock().await;
        Ok(live_mapping(&state, user_id).cloned())
    }

    async fn insert_customer_mapping(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<CustomerMapping> {
        let mut state = self.state.lock().await;

        if std::mem::take(&mut state.fail_next_mapping_insert) {
            return Err(BillingError::Database(
                "Failed to save customer mapping: connection reset".to_string(),
            ));
        }

        if let Some(winner) = state.race_winner.take() {
            state.mappings.push(CustomerMapping {
                user_id,
                customer_id: winner,
                created_at: OffsetDateTime::now_utc(),
                deleted_at: None,
            });
        }

        if live_mapping(&state, user_id).is_some() {
            return Err(BillingError::Database(format!(
                "Failed to save customer mapping: user {} already has a live customer",
                user_id
            )));
        }
        if state.mappings.iter().any(|m| m.customer_id == customer_id) {
            return Err(BillingError::Database(format!(
                "Failed to save customer mapping: customer {} already mapped",
                customer_id
            )));
        }

        let mapping = CustomerMapping {
            user_id,
            customer_id: customer_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        state.mappings.push(mapping.clone());
        Ok(mapping)
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .find(|m| m.customer_id == customer_id && m.is_live())
            .map(|m| m.user_id))
    }

    async fn list_live_customer_ids(&self) -> BillingResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .filter(|m| m.is_live())
            .map(|m| m.customer_id.clone())
            .collect())
    }

    async fn get_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.subscription(customer_id).await)
    }

    async fn ensure_subscription_placeholder(&self, customer_id: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.subscriptions.contains_key(customer_id) {
            return Ok(false);
        }
        state.subscriptions.insert(
            customer_id.to_string(),
            SubscriptionRecord::placeholder(customer_id, OffsetDateTime::UNIX_EPOCH),
        );
        Ok(true)
    }

    async fn upsert_subscription(&self, snapshot: &SubscriptionSnapshot) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let existing = state.subscriptions.get(&snapshot.customer_id);
        if existing.is_some_and(|record| record.updated_at > snapshot.observed_at) {
            return Ok(false);
        }
        let record = snapshot.apply_to(existing);
        state
            .subscriptions
            .insert(snapshot.customer_id.clone(), record);
        Ok(true)
    }

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        Ok(self.profile(user_id).await)
    }

    async fn update_profile(&self, user_id: Uuid, patch: ProfilePatch) -> BillingResult<bool> {
        if patch.is_empty() {
            return Ok(true);
        }
        let mut state = self.state.lock().await;
        let Some(profile) = state.profiles.get_mut(&user_id) else {
            return Ok(false);
        };
        if let Some(status) = patch.billing_status {
            profile.billing_status = status;
        }
        if let Some(completed) = patch.onboarding_completed {
            profile.onboarding_completed = completed;
        }
        state.profile_writes += 1;
        Ok(true)
    }

    async fn update_user_billing(
        &self,
        projection: &UserBillingProjection,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.users.get_mut(&projection.id) {
            Some(user) => {
                *user = projection.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_properties(&self, user_id: Uuid) -> BillingResult<Vec<Property>> {
        let state = self.state.lock().await;
        let referenced: Vec<Uuid> = state
            .properties
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| p.parent_property_id)
            .collect();

        let mut rows: Vec<Property> = state
            .properties
            .iter()
            .filter(|p| p.user_id == user_id || referenced.contains(&p.id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(rows)
    }

    async fn save_property_assignments(
        &self,
        user_id: Uuid,
        assignments: &[PropertyAssignment],
    ) -> BillingResult<usize> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for assignment in assignments {
            if let Some(row) = state
                .properties
                .iter_mut()
                .find(|p| p.id == assignment.property_id && p.user_id == user_id)
            {
                row.address_hash = assignment.address_hash.clone();
                row.parent_property_id = assignment.parent_property_id;
                row.is_parent = assignment.is_parent;
                row.position_in_tier = assignment.position_in_tier;
                row.monthly_rate_cents = assignment.monthly_rate_cents;
                written += 1;
            }
        }
        Ok(written)
    }
}

/// A provider subscription with fixed period bounds and no card
pub fn provider_subscription(id: &str, status: SubscriptionStatus) -> ProviderSubscription {
    ProviderSubscription {
        id: id.to_string(),
        status,
        price_id: Some("price_test".to_string()),
        current_period_start: 1_735_689_600,
        current_period_end: 1_738_368_000,
        cancel_at_period_end: false,
        payment_method: None,
    }
}

#[derive(Default)]
struct ProviderState {
    next_id: u64,
    customers: Vec<(Uuid, String)>,
    deleted_customers: Vec<String>,
    products: Vec<(String, String)>,
    prices: Vec<(String, CreatePriceRequest)>,
    sessions: Vec<CheckoutSessionRequest>,
    subscriptions: HashMap<String, ProviderSubscription>,
    subscription_reads: usize,
    fail_subscription_reads: bool,
    fail_checkout_sessions: bool,
}

impl ProviderState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_test_{}", prefix, self.next_id)
    }
}

/// Scripted stand-in for Stripe that records every call
#[derive(Default)]
pub struct MockBillingProvider {
    state: Mutex<ProviderState>,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// What `latest_subscription` returns for the customer from now on
    pub async fn set_subscription(&self, customer_id: &str, subscription: ProviderSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(customer_id.to_string(), subscription);
    }

    pub async fn fail_subscription_reads(&self, fail: bool) {
        self.state.lock().await.fail_subscription_reads = fail;
    }

    pub async fn fail_checkout_sessions(&self, fail: bool) {
        self.state.lock().await.fail_checkout_sessions = fail;
    }

    pub async fn seed_product(&self, name: &str) -> String {
        let mut state = self.state.lock().await;
        let id = state.next_id("prod");
        state.products.push((id.clone(), name.to_string()));
        id
    }

    pub async fn seed_price(&self, product_id: &str, lookup_key: &str) -> String {
        let mut state = self.state.lock().await;
        let id = state.next_id("price");
        state.prices.push((
            id.clone(),
            CreatePriceRequest {
                product_id: product_id.to_string(),
                unit_amount_cents: 1399,
                currency: "eur".to_string(),
                nickname: "seeded".to_string(),
                lookup_key: lookup_key.to_string(),
            },
        ));
        id
    }

    /// Customers ever created, in order
    pub async fn created_customers(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.customers.iter().map(|(_, id)| id.clone()).collect()
    }

    pub async fn deleted_customers(&self) -> Vec<String> {
        self.state.lock().await.deleted_customers.clone()
    }

    pub async fn product_count(&self) -> usize {
        self.state.lock().await.products.len()
    }

    pub async fn created_prices(&self) -> Vec<CreatePriceRequest> {
        let state = self.state.lock().await;
        state.prices.iter().map(|(_, req)| req.clone()).collect()
    }

    pub async fn sessions(&self) -> Vec<CheckoutSessionRequest> {
        self.state.lock().await.sessions.clone()
    }

    pub async fn subscription_reads(&self) -> usize {
        self.state.lock().await.subscription_reads
    }
}

#[async_trait]
impl BillingProvider for MockBillingProvider {
    async fn create_customer(&self, user_id: Uuid, _email: Option<&str>) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        let id = state.next_id("cus");
        state.customers.push((user_id, id.clone()));
        Ok(id)
    }

    async fn delete_customer(&self, customer_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if !state.customers.iter().any(|(_, id)| id == customer_id) {
            return Err(BillingError::StripeApi(format!(
                "No such customer: {}",
                customer_id
            )));
        }
        state.deleted_customers.push(customer_id.to_string());
        Ok(())
    }

    async fn find_active_product(&self, name: &str) -> BillingResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .iter()
            .find(|(_, product_name)| product_name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_product(&self, name: &str, _description: &str) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        let id = state.next_id("prod");
        state.products.push((id.clone(), name.to_string()));
        Ok(id)
    }

    async fn find_price(&self, lookup_key: &str) -> BillingResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .prices
            .iter()
            .find(|(_, req)| req.lookup_key == lookup_key)
            .map(|(id, _)| id.clone()))
    }

    async fn create_price(&self, request: &CreatePriceRequest) -> BillingResult<String> {
        let mut state = self.state.lock().await;
        let id = state.next_id("price");
        state.prices.push((id.clone(), request.clone()));
        Ok(id)
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<CheckoutSessionHandle> {
        let mut state = self.state.lock().await;
        if state.fail_checkout_sessions {
            return Err(BillingError::StripeApi(
                "Failed to create checkout session".to_string(),
            ));
        }
        let id = state.next_id("cs");
        state.sessions.push(request.clone());
        Ok(CheckoutSessionHandle {
            url: format!("https://checkout.stripe.com/c/pay/{}", id),
            id,
        })
    }

    async fn latest_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let mut state = self.state.lock().await;
        state.subscription_reads += 1;
        if state.fail_subscription_reads {
            return Err(BillingError::StripeApi(
                "Failed to list subscriptions".to_string(),
            ));
        }
        Ok(state.subscriptions.get(customer_id).cloned())
    }
}
