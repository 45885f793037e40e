//! Tiered pricing for managed properties
//!
//! Parents (standalone units and the anchor unit of each address group) are
//! priced from [`PRICING_TIERS`] by their ordinal position among the user's
//! parents. Children (further units at a parent's address) pay the flat
//! [`FLAT_CHILD_PRICE_CENTS`] regardless of how many there are.
//!
//! All amounts are integer euro cents.

use serde::{Deserialize, Serialize};

/// Monthly rate for a grouped (child) unit
pub const FLAT_CHILD_PRICE_CENTS: i64 = 399;

/// Upper end of a tier's position range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierBound {
    Finite(u32),
    Unbounded,
}

/// Positions `min..=max` are billed at `price_cents` each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PricingTier {
    pub min: u32,
    pub max: TierBound,
    pub price_cents: i64,
}

impl PricingTier {
    pub fn contains(&self, position: u32) -> bool {
        if position < self.min {
            return false;
        }
        match self.max {
            TierBound::Finite(max) => position <= max,
            TierBound::Unbounded => true,
        }
    }
}

/// Ordered, non-overlapping and covering `[1, ∞)`
pub const PRICING_TIERS: [PricingTier; 6] = [
    PricingTier {
        min: 1,
        max: TierBound::Finite(1),
        price_cents: 1399,
    },
    PricingTier {
        min: 2,
        max: TierBound::Finite(3),
        price_cents: 1199,
    },
    PricingTier {
        min: 4,
        max: TierBound::Finite(6),
        price_cents: 999,
    },
    PricingTier {
        min: 7,
        max: TierBound::Finite(10),
        price_cents: 799,
    },
    PricingTier {
        min: 11,
        max: TierBound::Finite(20),
        price_cents: 599,
    },
    PricingTier {
        min: 21,
        max: TierBound::Unbounded,
        price_cents: 399,
    },
];

/// Price of the parent at 1-indexed `position`
///
/// Returns the first tier containing `position`, or the last tier's price
/// when nothing matches.
pub fn tier_price(position: u32) -> i64 {
    PRICING_TIERS
        .iter()
        .find(|tier| tier.contains(position))
        .or_else(|| PRICING_TIERS.last())
        .map(|tier| tier.price_cents)
        .unwrap_or(FLAT_CHILD_PRICE_CENTS)
}

/// One unit fed to the allocation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedUnit {
    #[serde(alias = "isParent")]
    pub is_parent: bool,
    /// Stored tier position; units without one keep their input order
    #[serde(default, alias = "positionInTier")]
    pub position_in_tier: Option<u32>,
}

impl PricedUnit {
    pub fn parent(position_in_tier: Option<u32>) -> Self {
        Self {
            is_parent: true,
            position_in_tier,
        }
    }

    pub fn child() -> Self {
        Self {
            is_parent: false,
            position_in_tier: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakdownKind {
    Tiered,
    Flat,
}

impl BreakdownKind {
    pub fn label(&self) -> &'static str {
        match self {
            BreakdownKind::Tiered => "Independent + Group Parents (Tiered)",
            BreakdownKind::Flat => "Grouped Units (Flat)",
        }
    }
}

/// Aggregated line of a pricing breakdown
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownLine {
    pub kind: BreakdownKind,
    pub label: String,
    pub count: u32,
    /// Average per-unit price in euros
    pub average_price: f64,
    pub subtotal_cents: i64,
}

impl BreakdownLine {
    fn new(kind: BreakdownKind, count: u32, subtotal_cents: i64) -> Self {
        Self {
            kind,
            label: kind.label().to_string(),
            count,
            average_price: cents_to_euros(subtotal_cents) / f64::from(count),
            subtotal_cents,
        }
    }
}

/// Output of [`calculate_hybrid_pricing`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HybridPricing {
    /// Tiered parents
    pub bucket_a_cents: i64,
    /// Flat-rate children
    pub bucket_b_cents: i64,
    pub total_monthly_cents: i64,
    pub breakdown: Vec<BreakdownLine>,
}

impl HybridPricing {
    pub fn total_monthly(&self) -> f64 {
        cents_to_euros(self.total_monthly_cents)
    }
}

pub fn cents_to_euros(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Price a user's grouped units
///
/// Parents are ranked by stored position (stable, so ties and missing
/// positions keep input order) and the rank, not the stored value, selects
/// the tier. Pure and deterministic.
pub fn calculate_hybrid_pricing(units: &[PricedUnit]) -> HybridPricing {
    let mut parents: Vec<&PricedUnit> = units.iter().filter(|u| u.is_parent).collect();
    parents.sort_by_key(|u| u.position_in_tier.unwrap_or(u32::MAX));
    let child_count = units.iter().filter(|u| !u.is_parent).count() as u32;

    let bucket_a_cents: i64 = (1..=parents.len() as u32).map(tier_price).sum();
    let bucket_b_cents = i64::from(child_count) * FLAT_CHILD_PRICE_CENTS;

    let mut breakdown = Vec::with_capacity(2);
    if !parents.is_empty() {
        breakdown.push(BreakdownLine::new(
            BreakdownKind::Tiered,
            parents.len() as u32,
            bucket_a_cents,
        ));
    }
    if child_count > 0 {
        breakdown.push(BreakdownLine::new(
            BreakdownKind::Flat,
            child_count,
            bucket_b_cents,
        ));
    }

    HybridPricing {
        bucket_a_cents,
        bucket_b_cents,
        total_monthly_cents: bucket_a_cents + bucket_b_cents,
        breakdown,
    }
}
