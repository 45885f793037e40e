//! Subscription state synchronization
//!
//! The local `stripe_subscriptions` row is a mirror of whatever Stripe reports
//! for the customer *right now*. Event payloads are never trusted for state:
//! every pass re-reads the customer's latest subscription, upserts the mirror
//! and projects a simplified status onto the owning user's `profiles` and
//! `users` rows. Replaying an event therefore converges on the same row.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingStatus, ProfilePatch, SubscriptionSnapshot, SubscriptionStatus, UserBillingProjection,
    UserSubscriptionStatus,
};
use crate::provider::{BillingProvider, ProviderSubscription};
use crate::store::BillingStore;

/// Map a provider status onto the (profile, user) projection pair
pub fn project_status(status: SubscriptionStatus) -> (BillingStatus, UserSubscriptionStatus) {
    match status {
        SubscriptionStatus::Trialing => (BillingStatus::Trial, UserSubscriptionStatus::Trialing),
        SubscriptionStatus::Active => (BillingStatus::Active, UserSubscriptionStatus::Active),
        SubscriptionStatus::Canceled => {
            (BillingStatus::Canceled, UserSubscriptionStatus::Canceled)
        }
        SubscriptionStatus::PastDue => (BillingStatus::PastDue, UserSubscriptionStatus::PastDue),
        _ => (BillingStatus::Pending, UserSubscriptionStatus::None),
    }
}

/// Profile patch applied when a subscription checkout completes
pub fn onboarding_patch() -> ProfilePatch {
    ProfilePatch {
        billing_status: Some(BillingStatus::Trial),
        onboarding_completed: Some(true),
    }
}

/// Result of one synchronization pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub subscription_id: Option<String>,
    /// User owning the customer mapping, if any
    pub user_id: Option<Uuid>,
    /// False when a newer snapshot was already stored
    pub record_applied: bool,
}

/// Totals of a full reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub customers: usize,
    pub synced: usize,
    pub stale: usize,
    pub failed: Vec<ReconcileFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub customer_id: String,
    pub error: String,
}

/// What a user-facing client reads to decide which screen to show
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    /// `none` when the user has no live customer mapping
    pub status: SubscriptionStatus,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub billing_status: Option<BillingStatus>,
    pub onboarding_completed: bool,
}

#[derive(Clone)]
pub struct SubscriptionSynchronizer {
    provider: Arc<dyn BillingProvider>,
    store: Arc<dyn BillingStore>,
}

impl SubscriptionSynchronizer {
    pub fn new(provider: Arc<dyn BillingProvider>, store: Arc<dyn BillingStore>) -> Self {
        Self { provider, store }
    }

    /// Re-sync a customer after a subscription or invoice event
    pub async fn sync_customer(&self, customer_id: &str) -> BillingResult<SyncOutcome> {
        self.sync(customer_id, None).await
    }

    /// Re-sync after a completed subscription checkout
    ///
    /// `onboarding_user` comes from the session metadata. When it is the
    /// mapped user, the status projection and the onboarding flags land in
    /// a single profile write; otherwise the mapped user is projected first
    /// and the onboarding user patched second.
    pub async fn complete_checkout(
        &self,
        customer_id: &str,
        onboarding_user: Option<Uuid>,
    ) -> BillingResult<SyncOutcome> {
        self.sync(customer_id, onboarding_user).await
    }

    /// Manual re-sync for the customer a user is mapped to
    pub async fn sync_user(&self, user_id: Uuid) -> BillingResult<SyncOutcome> {
        let mapping = self
            .store
            .find_customer_mapping(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("No billing customer for user {}", user_id)))?;
        self.sync(&mapping.customer_id, None).await
    }

    /// Re-sync every customer with a live mapping
    ///
    /// Failures are collected per customer; one bad customer never stops
    /// the run.
    pub async fn sync_all(&self) -> BillingResult<ReconcileSummary> {
        let customer_ids = self.store.list_live_customer_ids().await?;
        let mut summary = ReconcileSummary {
            customers: customer_ids.len(),
            ..Default::default()
        };

        for customer_id in customer_ids {
            match self.sync(&customer_id, None).await {
                Ok(outcome) if outcome.record_applied => summary.synced += 1,
                Ok(_) => summary.stale += 1,
                Err(e) => {
                    tracing::error!(customer_id = %customer_id, error = %e, "Reconciliation failed for customer");
                    summary.failed.push(ReconcileFailure {
                        customer_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(summary)
    }

    /// Current subscription state as seen by the user
    pub async fn view_for_user(&self, user_id: Uuid) -> BillingResult<SubscriptionView> {
        let profile = self.store.get_profile(user_id).await?;
        let billing_status = profile.as_ref().map(|p| p.billing_status);
        let onboarding_completed = profile.as_ref().is_some_and(|p| p.onboarding_completed);

        let Some(mapping) = self.store.find_customer_mapping(user_id).await? else {
            return Ok(SubscriptionView {
                status: SubscriptionStatus::None,
                customer_id: None,
                subscription_id: None,
                current_period_end: None,
                cancel_at_period_end: false,
                billing_status,
                onboarding_completed,
            });
        };

        let record = self.store.get_subscription(&mapping.customer_id).await?;
        Ok(SubscriptionView {
            status: record
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(SubscriptionStatus::NotStarted),
            subscription_id: record.as_ref().and_then(|r| r.subscription_id.clone()),
            current_period_end: record.as_ref().and_then(|r| r.current_period_end),
            cancel_at_period_end: record.as_ref().is_some_and(|r| r.cancel_at_period_end),
            customer_id: Some(mapping.customer_id),
            billing_status,
            onboarding_completed,
        })
    }

    async fn sync(
        &self,
        customer_id: &str,
        onboarding_user: Option<Uuid>,
    ) -> BillingResult<SyncOutcome> {
        let observed_at = OffsetDateTime::now_utc();
        let latest = self.provider.latest_subscription(customer_id).await?;
        let user_id = self.store.user_for_customer(customer_id).await?;

        let snapshot = match &latest {
            Some(subscription) => snapshot_from(customer_id, subscription, observed_at),
            None => SubscriptionSnapshot::not_started(customer_id, observed_at),
        };
        let record_applied = self.store.upsert_subscription(&snapshot).await?;

        if !record_applied {
            tracing::info!(
                customer_id = %customer_id,
                "Stored subscription is newer than this read, skipping projection"
            );
        }

        // Only a fresh read of an existing subscription is projected
        let status_patch = match (&latest, user_id, record_applied) {
            (Some(subscription), Some(mapped_user), true) => {
                let (billing_status, subscription_status) = project_status(subscription.status);
                self.apply_user_projection(&UserBillingProjection {
                    id: mapped_user,
                    stripe_customer_id: Some(customer_id.to_string()),
                    stripe_subscription_id: Some(subscription.id.clone()),
                    subscription_status,
                })
                .await?;
                Some((
                    mapped_user,
                    ProfilePatch {
                        billing_status: Some(billing_status),
                        onboarding_completed: None,
                    },
                ))
            }
            (Some(_), None, _) => {
                tracing::warn!(customer_id = %customer_id, "No user mapped to customer, skipping projection");
                None
            }
            _ => None,
        };

        match (status_patch, onboarding_user) {
            (Some((mapped_user, patch)), Some(onboarding)) if mapped_user == onboarding => {
                self.apply_profile_patch(mapped_user, patch.merge(onboarding_patch()))
                    .await?;
            }
            (status_patch, onboarding) => {
                if let Some((mapped_user, patch)) = status_patch {
                    self.apply_profile_patch(mapped_user, patch).await?;
                }
                if let Some(onboarding) = onboarding {
                    self.apply_profile_patch(onboarding, onboarding_patch()).await?;
                }
            }
        }

        tracing::info!(
            customer_id = %customer_id,
            status = %snapshot.status,
            subscription_id = ?snapshot.subscription_id,
            user_id = ?user_id,
            record_applied = record_applied,
            "Subscription synchronized"
        );

        Ok(SyncOutcome {
            customer_id: customer_id.to_string(),
            status: snapshot.status,
            subscription_id: snapshot.subscription_id,
            user_id,
            record_applied,
        })
    }

    async fn apply_profile_patch(&self, user_id: Uuid, patch: ProfilePatch) -> BillingResult<()> {
        if !self.store.update_profile(user_id, patch).await? {
            tracing::warn!(user_id = %user_id, "Profile not found, billing status not updated");
        }
        Ok(())
    }

    async fn apply_user_projection(&self, projection: &UserBillingProjection) -> BillingResult<()> {
        if !self.store.update_user_billing(projection).await? {
            tracing::warn!(user_id = %projection.id, "User row not found, billing projection not updated");
        }
        Ok(())
    }
}

fn snapshot_from(
    customer_id: &str,
    subscription: &ProviderSubscription,
    observed_at: OffsetDateTime,
) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        customer_id: customer_id.to_string(),
        subscription_id: Some(subscription.id.clone()),
        price_id: subscription.price_id.clone(),
        status: subscription.status,
        current_period_start: Some(subscription.current_period_start),
        current_period_end: Some(subscription.current_period_end),
        cancel_at_period_end: subscription.cancel_at_period_end,
        payment_method: subscription.payment_method.clone(),
        observed_at,
    }
}
