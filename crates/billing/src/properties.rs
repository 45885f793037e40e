//! Property grouping and pricing over stored properties

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::grouping::{resolve_groups, GroupingResult};
use crate::pricing::{calculate_hybrid_pricing, HybridPricing};
use crate::store::BillingStore;

/// Grouping plus the monthly price it yields
#[derive(Debug, Clone, Serialize)]
pub struct PropertyPricing {
    pub grouping: GroupingResult,
    pub pricing: HybridPricing,
    /// Rows written; zero for read-only quotes
    pub updated: usize,
}

/// Runs the grouping resolver against a user's stored properties
///
/// The resolver is the only writer of the grouping columns; everything
/// else reads them.
#[derive(Clone)]
pub struct PropertyPricingService {
    store: Arc<dyn BillingStore>,
}

impl PropertyPricingService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Resolve and price without writing anything
    pub async fn quote(&self, user_id: Uuid) -> BillingResult<PropertyPricing> {
        let properties = self.store.list_properties(user_id).await?;
        let grouping = resolve_groups(user_id, &properties)?;
        let pricing = calculate_hybrid_pricing(&grouping.priced_units());

        Ok(PropertyPricing {
            grouping,
            pricing,
            updated: 0,
        })
    }

    /// Resolve, persist the assignments that changed, and price
    pub async fn regroup(&self, user_id: Uuid) -> BillingResult<PropertyPricing> {
        let properties = self.store.list_properties(user_id).await?;
        let grouping = resolve_groups(user_id, &properties)?;

        let changes: Vec<_> = grouping
            .changes(&properties)
            .into_iter()
            .cloned()
            .collect();
        let updated = if changes.is_empty() {
            0
        } else {
            self.store
                .save_property_assignments(user_id, &changes)
                .await?
        };

        let pricing = calculate_hybrid_pricing(&grouping.priced_units());
        tracing::info!(
            user_id = %user_id,
            properties = grouping.assignments.len(),
            parents = grouping.parent_count(),
            updated = updated,
            total_monthly_cents = pricing.total_monthly_cents,
            "Regrouped properties"
        );

        Ok(PropertyPricing {
            grouping,
            pricing,
            updated,
        })
    }
}
