//! Billing routes
//!
//! Checkout, subscription state and the Stripe webhook.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use priceye_billing::{
    CheckoutRequest, CheckoutResponse, CheckoutUser, SubscriptionView, SyncOutcome,
};
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Create a checkout session for the main license subscription
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let user = CheckoutUser {
        id: auth_user.user_id,
        email: auth_user.email,
    };

    tracing::info!(
        user_id = %user.id,
        mode = ?req.mode,
        trial_period_days = ?req.trial_period_days,
        "Creating checkout session"
    );

    let session = state.billing.checkout.create_checkout(&user, &req).await?;
    Ok(Json(session))
}

/// Subscription state for the current user
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let view = state
        .billing
        .synchronizer
        .view_for_user(auth_user.user_id)
        .await?;
    Ok(Json(view))
}

/// Re-read the user's subscription from Stripe
pub async fn sync_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SyncOutcome>> {
    let outcome = state
        .billing
        .synchronizer
        .sync_user(auth_user.user_id)
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        customer_id = %outcome.customer_id,
        status = %outcome.status,
        "Manual subscription sync finished"
    );
    Ok(Json(outcome))
}

/// Handle Stripe webhook events
///
/// The body is verified before anything parses it. Processing continues on
/// the background task runner after the acknowledgement is sent.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::from(e)
        })?;

    let handler = state.billing.webhooks.clone();
    state
        .tasks
        .spawn("stripe_webhook", async move {
            match handler.handle_event(&event).await {
                Ok(Some(outcome)) => tracing::info!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    customer_id = %outcome.customer_id,
                    status = %outcome.status,
                    applied = outcome.record_applied,
                    "Stripe webhook processed"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    error = %e,
                    "Stripe webhook processing failed"
                ),
            }
        })
        .await;

    Ok(Json(json!({ "received": true })))
}

/// Plain OPTIONS on the webhook; CORS preflights are answered by the layer
pub async fn webhook_options() -> StatusCode {
    StatusCode::NO_CONTENT
}
