//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing tables. They can be run
//! after a reconciliation pass or a webhook replay to confirm the mirror,
//! the projections and the property grouping still agree.
//!
//! Checks only read; violations carry enough context to debug.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customer may be charged incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateMappingRow {
    user_id: Uuid,
    mapping_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PositionGapRow {
    user_id: Uuid,
    parent_count: i64,
    unpositioned: i64,
    distinct_positions: i64,
    max_position: Option<i32>,
}

#[derive(Debug, sqlx::FromRow)]
struct ChildAddressRow {
    user_id: Uuid,
    property_id: Uuid,
    parent_property_id: Uuid,
    child_hash: String,
    parent_hash: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileMismatchRow {
    user_id: Uuid,
    customer_id: String,
    subscription_status: String,
    billing_status: String,
    expected_billing_status: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_live_customer_mapping().await?);
        violations.extend(self.check_dense_parent_positions().await?);
        violations.extend(self.check_child_shares_parent_address().await?);
        violations.extend(self.check_profile_matches_subscription().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: At most one live customer mapping per user
    ///
    /// A second live customer would let the same user hold two subscriptions.
    async fn check_single_live_customer_mapping(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateMappingRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS mapping_count
            FROM stripe_customers
            WHERE deleted_at IS NULL
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_live_customer_mapping".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} live customer mappings (expected 1)",
                    row.mapping_count
                ),
                context: serde_json::json!({
                    "mapping_count": row.mapping_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Parent positions are exactly 1..N per user
    async fn check_dense_parent_positions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PositionGapRow> = sqlx::query_as(
            r#"
            SELECT
                user_id,
                COUNT(*) AS parent_count,
                COUNT(*) FILTER (WHERE position_in_tier IS NULL) AS unpositioned,
                COUNT(DISTINCT position_in_tier) AS distinct_positions,
                MAX(position_in_tier) AS max_position
            FROM properties
            WHERE is_parent = TRUE
            GROUP BY user_id
            HAVING COUNT(*) FILTER (WHERE position_in_tier IS NULL) > 0
                OR COUNT(DISTINCT position_in_tier) <> COUNT(*)
                OR MIN(position_in_tier) <> 1
                OR MAX(position_in_tier) <> COUNT(*)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "dense_parent_positions".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} parents but positions are not 1..{}",
                    row.parent_count, row.parent_count
                ),
                context: serde_json::json!({
                    "parent_count": row.parent_count,
                    "unpositioned": row.unpositioned,
                    "distinct_positions": row.distinct_positions,
                    "max_position": row.max_position,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: A child carries its parent's address hash
    async fn check_child_shares_parent_address(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ChildAddressRow> = sqlx::query_as(
            r#"
            SELECT
                c.user_id,
                c.id AS property_id,
                p.id AS parent_property_id,
                c.address_hash AS child_hash,
                p.address_hash AS parent_hash
            FROM properties c
            JOIN properties p ON p.id = c.parent_property_id
            WHERE c.is_parent = FALSE
              AND c.address_hash <> p.address_hash
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "child_shares_parent_address".to_string(),
                user_ids: vec![row.user_id],
                description: "Grouped property does not share its parent's address".to_string(),
                context: serde_json::json!({
                    "property_id": row.property_id,
                    "parent_property_id": row.parent_property_id,
                    "child_hash": row.child_hash,
                    "parent_hash": row.parent_hash,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Profile billing status matches the mirrored subscription
    ///
    /// Only the four statuses with a direct projection are compared.
    async fn check_profile_matches_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ProfileMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                c.user_id,
                c.customer_id,
                s.status AS subscription_status,
                pr.billing_status,
                CASE s.status
                    WHEN 'trialing' THEN 'trial'
                    ELSE s.status
                END AS expected_billing_status
            FROM stripe_customers c
            JOIN stripe_subscriptions s ON s.customer_id = c.customer_id
            JOIN profiles pr ON pr.id = c.user_id
            WHERE c.deleted_at IS NULL
              AND s.status IN ('trialing', 'active', 'past_due', 'canceled')
              AND pr.billing_status <> CASE s.status
                    WHEN 'trialing' THEN 'trial'
                    ELSE s.status
                  END
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "profile_matches_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Profile shows '{}' but subscription is '{}'",
                    row.billing_status, row.subscription_status
                ),
                context: serde_json::json!({
                    "customer_id": row.customer_id,
                    "subscription_status": row.subscription_status,
                    "billing_status": row.billing_status,
                    "expected_billing_status": row.expected_billing_status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_live_customer_mapping" => self.check_single_live_customer_mapping().await,
            "dense_parent_positions" => self.check_dense_parent_positions().await,
            "child_shares_parent_address" => self.check_child_shares_parent_address().await,
            "profile_matches_subscription" => self.check_profile_matches_subscription().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_live_customer_mapping",
            "dense_parent_positions",
            "child_shares_parent_address",
            "profile_matches_subscription",
        ]
    }
}
