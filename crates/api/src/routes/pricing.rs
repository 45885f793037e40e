//! Pricing routes

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    Json,
};
use priceye_billing::{calculate_hybrid_pricing, HybridPricing, PricedUnit, PropertyPricing};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub properties: Vec<PricedUnit>,
}

/// Monthly price with the euro total alongside the cent buckets
#[derive(Debug, Serialize)]
pub struct PricingResponse {
    #[serde(flatten)]
    pub pricing: HybridPricing,
    pub total_monthly: f64,
}

impl From<HybridPricing> for PricingResponse {
    fn from(pricing: HybridPricing) -> Self {
        Self {
            total_monthly: pricing.total_monthly(),
            pricing,
        }
    }
}

/// Price an arbitrary set of units without touching storage
pub async fn preview(
    payload: Result<Json<PreviewRequest>, JsonRejection>,
) -> ApiResult<Json<PricingResponse>> {
    let Json(req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(calculate_hybrid_pricing(&req.properties).into()))
}

/// Grouping and price of the current user's stored properties
pub async fn get_pricing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PropertyPricing>> {
    let quote = state.billing.properties.quote(auth_user.user_id).await?;
    Ok(Json(quote))
}

/// Re-run grouping and persist the assignments that changed
pub async fn regroup(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<PropertyPricing>> {
    let result = state.billing.properties.regroup(auth_user.user_id).await?;
    Ok(Json(result))
}
