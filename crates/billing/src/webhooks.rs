//! Stripe webhook handling
//!
//! Verification works on the raw request body and happens before anything
//! looks at the JSON. Verified events are classified and handed to the
//! [`SubscriptionSynchronizer`], which re-reads the customer's state from
//! Stripe instead of trusting the payload.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{SubscriptionSynchronizer, SyncOutcome};

type HmacSha256 = Hmac<Sha256>;

/// A verified Stripe event; only the fields routing needs are typed
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// What to do with a verified event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    /// Subscription checkout finished; sync and mark the user onboarded
    CompleteCheckout {
        customer_id: String,
        user_id: Option<Uuid>,
    },
    /// Subscription or invoice change; sync the customer
    SyncCustomer { customer_id: String },
    Ignore { reason: &'static str },
}

/// Check a `Stripe-Signature` header against the raw body
///
/// The header is `t=<unix>,v1=<hex>[,v1=<hex>...]`. The expected signature is
/// HMAC-SHA256 over `"<t>.<body>"` keyed with the full signing secret. Any
/// matching `v1` entry passes, provided `t` is within `tolerance_secs` of
/// `now`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // `t` is caller-chosen, so the distance must not overflow
    let drift = now.abs_diff(timestamp);
    if drift > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = drift,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if std::str::from_utf8(payload).is_err() {
        tracing::warn!("Webhook body is not valid UTF-8");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if !matched {
        tracing::warn!(candidates = signatures.len(), "Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Decide how a verified event is processed
pub fn classify_event(event: &WebhookEvent) -> WebhookAction {
    let object = &event.data.object;

    let Some(customer) = object.get("customer") else {
        return WebhookAction::Ignore {
            reason: "no customer field",
        };
    };

    if event.type_ == "payment_intent.succeeded"
        && object.get("invoice").is_some_and(|invoice| invoice.is_null())
    {
        return WebhookAction::Ignore {
            reason: "one-off payment intent",
        };
    }

    let Some(customer_id) = customer.as_str().filter(|id| !id.is_empty()) else {
        tracing::error!(
            event_id = %event.id,
            event_type = %event.type_,
            "Event carries no customer id string"
        );
        return WebhookAction::Ignore {
            reason: "customer is not a string",
        };
    };
    let customer_id = customer_id.to_string();

    match event.type_.as_str() {
        "checkout.session.completed" => {
            if object.get("mode").and_then(|m| m.as_str()) != Some("subscription") {
                return WebhookAction::Ignore {
                    reason: "checkout not in subscription mode",
                };
            }
            let user_id = object
                .get("metadata")
                .and_then(|m| m.get("user_id"))
                .and_then(|u| u.as_str())
                .and_then(|raw| match Uuid::parse_str(raw) {
                    Ok(id) => Some(id),
                    Err(_) => {
                        tracing::warn!(event_id = %event.id, user_id = %raw, "Checkout metadata user_id is not a UUID");
                        None
                    }
                });
            WebhookAction::CompleteCheckout {
                customer_id,
                user_id,
            }
        }
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted"
        | "invoice.paid"
        | "invoice.payment_failed" => WebhookAction::SyncCustomer { customer_id },
        _ => WebhookAction::Ignore {
            reason: "unhandled event type",
        },
    }
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    tolerance_secs: i64,
    synchronizer: SubscriptionSynchronizer,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: String,
        tolerance_secs: i64,
        synchronizer: SubscriptionSynchronizer,
    ) -> Self {
        Self {
            webhook_secret,
            tolerance_secs,
            synchronizer,
        }
    }

    /// Verify and parse a Stripe webhook event
    pub fn verify_event(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookEvent> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_event_at(payload, signature, now)
    }

    pub fn verify_event_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.tolerance_secs,
            now,
        )?;

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(error = %e, "Verified webhook body is not a Stripe event");
            BillingError::InvalidPayload(e.to_string())
        })?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            event_created = event.created,
            "Stripe webhook event verified"
        );
        Ok(event)
    }

    /// Process a verified event
    ///
    /// Returns `None` when the event is irrelevant or malformed; those are
    /// logged and dropped since the sender has already been acknowledged.
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<Option<SyncOutcome>> {
        match classify_event(event) {
            WebhookAction::CompleteCheckout {
                customer_id,
                user_id,
            } => {
                tracing::info!(
                    event_id = %event.id,
                    customer_id = %customer_id,
                    user_id = ?user_id,
                    "Processing subscription checkout"
                );
                let outcome = self
                    .synchronizer
                    .complete_checkout(&customer_id, user_id)
                    .await?;
                Ok(Some(outcome))
            }
            WebhookAction::SyncCustomer { customer_id } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    customer_id = %customer_id,
                    "Processing subscription event"
                );
                let outcome = self.synchronizer.sync_customer(&customer_id).await?;
                Ok(Some(outcome))
            }
            WebhookAction::Ignore { reason } => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    reason = reason,
                    "Ignoring webhook event"
                );
                Ok(None)
            }
        }
    }
}
