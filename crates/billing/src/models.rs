//! Persisted billing entities and their status enums

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Provider subscription status as mirrored in `stripe_subscriptions.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Placeholder written before the customer has ever subscribed
    NotStarted,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    None,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::NotStarted => "not_started",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::None => "none",
        }
    }

    /// Parse a stored status; unknown values read as `None`
    pub fn parse(value: &str) -> Self {
        match value {
            "not_started" => SubscriptionStatus::NotStarted,
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            "unpaid" => SubscriptionStatus::Unpaid,
            "paused" => SubscriptionStatus::Paused,
            _ => SubscriptionStatus::None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing billing state stored on `profiles.billing_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Pending,
    Trial,
    Active,
    PastDue,
    Canceled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Trial => "trial",
            BillingStatus::Active => "active",
            BillingStatus::PastDue => "past_due",
            BillingStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "trial" => BillingStatus::Trial,
            "active" => BillingStatus::Active,
            "past_due" => BillingStatus::PastDue,
            "canceled" => BillingStatus::Canceled,
            _ => BillingStatus::Pending,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat subscription status stored on `users.subscription_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSubscriptionStatus {
    None,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl UserSubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserSubscriptionStatus::None => "none",
            UserSubscriptionStatus::Trialing => "trialing",
            UserSubscriptionStatus::Active => "active",
            UserSubscriptionStatus::PastDue => "past_due",
            UserSubscriptionStatus::Canceled => "canceled",
        }
    }
}

/// Link between an application user and a billing provider customer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerMapping {
    pub user_id: Uuid,
    pub customer_id: String,
    pub created_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl CustomerMapping {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Local mirror of the provider's subscription for one customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    /// Epoch seconds
    pub current_period_start: Option<i64>,
    /// Epoch seconds
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub payment_method_brand: Option<String>,
    pub payment_method_last4: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// The `not_started` row checkout writes before the provider knows anything
    pub fn placeholder(customer_id: &str, at: OffsetDateTime) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            subscription_id: None,
            price_id: None,
            status: SubscriptionStatus::NotStarted,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            payment_method_brand: None,
            payment_method_last4: None,
            updated_at: at,
        }
    }
}

/// Card details of an expanded payment method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSummary {
    pub brand: Option<String>,
    pub last4: Option<String>,
}

/// What a synchronization pass writes for a customer
///
/// `payment_method` is `None` when the provider only returned an id (or
/// nothing); the stored brand/last4 are then left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub payment_method: Option<CardSummary>,
    /// When the provider was read; orders competing writes
    pub observed_at: OffsetDateTime,
}

impl SubscriptionSnapshot {
    pub fn not_started(customer_id: &str, observed_at: OffsetDateTime) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            subscription_id: None,
            price_id: None,
            status: SubscriptionStatus::NotStarted,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            payment_method: None,
            observed_at,
        }
    }

    /// Apply this snapshot over an existing record (or none)
    pub fn apply_to(&self, existing: Option<&SubscriptionRecord>) -> SubscriptionRecord {
        let (brand, last4) = match (&self.payment_method, existing) {
            (Some(card), _) => (card.brand.clone(), card.last4.clone()),
            (None, Some(prev)) => (
                prev.payment_method_brand.clone(),
                prev.payment_method_last4.clone(),
            ),
            (None, None) => (None, None),
        };

        SubscriptionRecord {
            customer_id: self.customer_id.clone(),
            subscription_id: self.subscription_id.clone(),
            price_id: self.price_id.clone(),
            status: self.status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            payment_method_brand: brand,
            payment_method_last4: last4,
            updated_at: self.observed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub full_name: Option<String>,
    pub company_name: Option<String>,
    pub billing_status: BillingStatus,
    pub onboarding_completed: bool,
}

/// Partial profile update; `None` fields are left as stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub billing_status: Option<BillingStatus>,
    pub onboarding_completed: Option<bool>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.billing_status.is_none() && self.onboarding_completed.is_none()
    }

    /// Combine two patches, fields set in `later` win
    pub fn merge(self, later: ProfilePatch) -> ProfilePatch {
        ProfilePatch {
            billing_status: later.billing_status.or(self.billing_status),
            onboarding_completed: later.onboarding_completed.or(self.onboarding_completed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserBillingProjection {
    pub id: Uuid,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub subscription_status: UserSubscriptionStatus,
}

/// A managed unit as stored in `properties`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Property {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: Option<String>,
    pub address: String,
    /// Empty until the grouping resolver has hashed the address
    pub address_hash: String,
    pub parent_property_id: Option<Uuid>,
    pub is_parent: bool,
    pub position_in_tier: Option<u32>,
    pub monthly_rate_cents: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
