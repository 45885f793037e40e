//! Local persistence for customer mappings, the subscription mirror,
//! user-facing projections and properties

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::grouping::PropertyAssignment;
use crate::models::{
    BillingStatus, CustomerMapping, Profile, ProfilePatch, Property, SubscriptionRecord,
    SubscriptionSnapshot, SubscriptionStatus, UserBillingProjection,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Live (not soft-deleted) mapping for a user
    async fn find_customer_mapping(&self, user_id: Uuid) -> BillingResult<Option<CustomerMapping>>;

    /// Fails if the user already has a live mapping
    async fn insert_customer_mapping(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<CustomerMapping>;

    /// Owner of a live mapping
    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>>;

    async fn list_live_customer_ids(&self) -> BillingResult<Vec<String>>;

    async fn get_subscription(&self, customer_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// Write a `not_started` row unless one exists; true when written
    ///
    /// The placeholder is stamped at the epoch so any provider read outranks it.
    async fn ensure_subscription_placeholder(&self, customer_id: &str) -> BillingResult<bool>;

    /// Atomic upsert keyed by customer id
    ///
    /// Skipped (returns false) when the stored row was observed later than
    /// `snapshot`.
    async fn upsert_subscription(&self, snapshot: &SubscriptionSnapshot) -> BillingResult<bool>;

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>>;

    /// Returns false when the profile row does not exist
    async fn update_profile(&self, user_id: Uuid, patch: ProfilePatch) -> BillingResult<bool>;

    /// Returns false when the user row does not exist
    async fn update_user_billing(&self, projection: &UserBillingProjection)
        -> BillingResult<bool>;

    /// The user's properties plus any other user's rows they point at
    async fn list_properties(&self, user_id: Uuid) -> BillingResult<Vec<Property>>;

    /// Persist resolver output; returns the number of rows written
    async fn save_property_assignments(
        &self,
        user_id: Uuid,
        assignments: &[PropertyAssignment],
    ) -> BillingResult<usize>;
}

#[derive(Debug, FromRow)]
struct CustomerRow {
    user_id: Uuid,
    customer_id: String,
    created_at: OffsetDateTime,
    deleted_at: Option<OffsetDateTime>,
}

impl From<CustomerRow> for CustomerMapping {
    fn from(row: CustomerRow) -> Self {
        CustomerMapping {
            user_id: row.user_id,
            customer_id: row.customer_id,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    customer_id: String,
    subscription_id: Option<String>,
    price_id: Option<String>,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    cancel_at_period_end: bool,
    payment_method_brand: Option<String>,
    payment_method_last4: Option<String>,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionRecord {
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            price_id: row.price_id,
            status: SubscriptionStatus::parse(&row.status),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            payment_method_brand: row.payment_method_brand,
            payment_method_last4: row.payment_method_last4,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: Uuid,
    full_name: Option<String>,
    company_name: Option<String>,
    billing_status: String,
    onboarding_completed: bool,
}

#[derive(Debug, FromRow)]
struct PropertyRow {
    id: Uuid,
    user_id: Uuid,
    name: Option<String>,
    address: String,
    address_hash: String,
    parent_property_id: Option<Uuid>,
    is_parent: bool,
    position_in_tier: Option<i32>,
    monthly_rate_cents: i64,
    created_at: OffsetDateTime,
}

impl From<PropertyRow> for Property {
    fn from(row: PropertyRow) -> Self {
        Property {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            address: row.address,
            address_hash: row.address_hash,
            parent_property_id: row.parent_property_id,
            is_parent: row.is_parent,
            position_in_tier: row.position_in_tier.and_then(|p| u32::try_from(p).ok()),
            monthly_rate_cents: row.monthly_rate_cents,
            created_at: row.created_at,
        }
    }
}

/// Postgres-backed [`BillingStore`]
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_customer_mapping(&self, user_id: Uuid) -> BillingResult<Option<CustomerMapping>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT user_id, customer_id, created_at, deleted_at
            FROM stripe_customers
            WHERE user_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CustomerMapping::from))
    }

    async fn insert_customer_mapping(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<CustomerMapping> {
        let row: CustomerRow = sqlx::query_as(
            r#"
            INSERT INTO stripe_customers (user_id, customer_id)
            VALUES ($1, $2)
            RETURNING user_id, customer_id, created_at, deleted_at
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(format!("Failed to save customer mapping: {}", e)))?;

        Ok(row.into())
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let user_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM stripe_customers
            WHERE customer_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user_id.map(|(id,)| id))
    }

    async fn list_live_customer_ids(&self) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT customer_id
            FROM stripe_customers
            WHERE deleted_at IS NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_subscription(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT customer_id, subscription_id, price_id, status,
                   current_period_start, current_period_end, cancel_at_period_end,
                   payment_method_brand, payment_method_last4, updated_at
            FROM stripe_subscriptions
            WHERE customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SubscriptionRecord::from))
    }

    async fn ensure_subscription_placeholder(&self, customer_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO stripe_subscriptions (customer_id, status, updated_at)
            VALUES ($1, 'not_started', TO_TIMESTAMP(0))
            ON CONFLICT (customer_id) DO NOTHING
            "#,
        )
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_subscription(&self, snapshot: &SubscriptionSnapshot) -> BillingResult<bool> {
        let (brand, last4) = match &snapshot.payment_method {
            Some(card) => (card.brand.clone(), card.last4.clone()),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO stripe_subscriptions (
                customer_id, subscription_id, price_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                payment_method_brand, payment_method_last4, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (customer_id) DO UPDATE SET
                subscription_id = EXCLUDED.subscription_id,
                price_id = EXCLUDED.price_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                payment_method_brand = CASE WHEN $11
                    THEN EXCLUDED.payment_method_brand
                    ELSE stripe_subscriptions.payment_method_brand END,
                payment_method_last4 = CASE WHEN $11
                    THEN EXCLUDED.payment_method_last4
                    ELSE stripe_subscriptions.payment_method_last4 END,
                updated_at = EXCLUDED.updated_at
            WHERE stripe_subscriptions.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(&snapshot.customer_id)
        .bind(&snapshot.subscription_id)
        .bind(&snapshot.price_id)
        .bind(snapshot.status.as_str())
        .bind(snapshot.current_period_start)
        .bind(snapshot.current_period_end)
        .bind(snapshot.cancel_at_period_end)
        .bind(brand)
        .bind(last4)
        .bind(snapshot.observed_at)
        .bind(snapshot.payment_method.is_some())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT id, full_name, company_name, billing_status, onboarding_completed
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Profile {
            id: row.id,
            full_name: row.full_name,
            company_name: row.company_name,
            billing_status: BillingStatus::parse(&row.billing_status),
            onboarding_completed: row.onboarding_completed,
        }))
    }

    async fn update_profile(&self, user_id: Uuid, patch: ProfilePatch) -> BillingResult<bool> {
        if patch.is_empty() {
            return Ok(true);
        }

        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET billing_status = COALESCE($2, billing_status),
                onboarding_completed = COALESCE($3, onboarding_completed),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(patch.billing_status.map(|s| s.as_str()))
        .bind(patch.onboarding_completed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_user_billing(
        &self,
        projection: &UserBillingProjection,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET stripe_customer_id = $2,
                stripe_subscription_id = $3,
                subscription_status = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(projection.id)
        .bind(&projection.stripe_customer_id)
        .bind(&projection.stripe_subscription_id)
        .bind(projection.subscription_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_properties(&self, user_id: Uuid) -> BillingResult<Vec<Property>> {
        let rows: Vec<PropertyRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, address, address_hash, parent_property_id,
                   is_parent, position_in_tier, monthly_rate_cents, created_at
            FROM properties
            WHERE user_id = $1
            UNION
            SELECT p.id, p.user_id, p.name, p.address, p.address_hash, p.parent_property_id,
                   p.is_parent, p.position_in_tier, p.monthly_rate_cents, p.created_at
            FROM properties p
            JOIN properties c ON c.parent_property_id = p.id
            WHERE c.user_id = $1 AND p.user_id <> $1
            ORDER BY created_at, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Property::from).collect())
    }

    async fn save_property_assignments(
        &self,
        user_id: Uuid,
        assignments: &[PropertyAssignment],
    ) -> BillingResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for assignment in assignments {
            let position = assignment
                .position_in_tier
                .map(i32::try_from)
                .transpose()
                .map_err(|_| BillingError::InvalidInput("Tier position out of range".to_string()))?;

            let result = sqlx::query(
                r#"
                UPDATE properties
                SET address_hash = $3,
                    parent_property_id = $4,
                    is_parent = $5,
                    position_in_tier = $6,
                    monthly_rate_cents = $7,
                    updated_at = NOW()
                WHERE id = $1 AND user_id = $2
                "#,
            )
            .bind(assignment.property_id)
            .bind(user_id)
            .bind(&assignment.address_hash)
            .bind(assignment.parent_property_id)
            .bind(assignment.is_parent)
            .bind(position)
            .bind(assignment.monthly_rate_cents)
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(written)
    }
}
