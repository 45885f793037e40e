//! HTTP routes
//!
//! Public: health, the Stripe webhook and the pricing preview.
//! Everything that acts on a user's own billing goes through `require_auth`.

pub mod billing;
pub mod pricing;


use axum::{
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route(
            "/webhook",
            post(billing::webhook).options(billing::webhook_options),
        )
        .route("/pricing/preview", post(pricing::preview));

    let protected = Router::new()
        .route("/checkout", post(billing::create_checkout))
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/sync", post(billing::sync_subscription))
        .route("/pricing", get(pricing::get_pricing))
        .route("/properties/regroup", post(pricing::regroup))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
}

/// Browser clients call from any origin
///
/// GET stays allowed for the authenticated read endpoints.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ])
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
