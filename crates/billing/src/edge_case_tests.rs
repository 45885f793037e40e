// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Boundary conditions and ordering hazards across:
//! - Subscription synchronization (stale reads, missing rows, replays)
//! - Checkout completion (same and different onboarding user)
//! - Webhook processing end to end
//! - Tier pricing at table boundaries

#[cfg(test)]
mod sync_tests {
    use std::sync::Arc;

    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    use crate::error::BillingError;
    use crate::models::{
        BillingStatus, CardSummary, SubscriptionRecord, SubscriptionStatus, UserSubscriptionStatus,
    };
    use crate::store::BillingStore;
    use crate::subscriptions::SubscriptionSynchronizer;
    use crate::testing::{provider_subscription, InMemoryBillingStore, MockBillingProvider};

    struct Harness {
        provider: Arc<MockBillingProvider>,
        store: Arc<InMemoryBillingStore>,
        sync: SubscriptionSynchronizer,
    }

    async fn harness() -> Harness {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let sync = SubscriptionSynchronizer::new(provider.clone(), store.clone());
        Harness {
            provider,
            store,
            sync,
        }
    }

    async fn mapped_user(h: &Harness, customer_id: &str) -> Uuid {
        let user = Uuid::new_v4();
        h.store.seed_user(user).await;
        h.store.seed_mapping(user, customer_id).await;
        user
    }

    // =========================================================================
    // Checkout completion for the mapped user: one merged profile write
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_same_user_single_profile_write() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Trialing))
            .await;

        let outcome = h.sync.complete_checkout("cus_1", Some(user)).await.unwrap();

        assert!(outcome.record_applied);
        assert_eq!(outcome.user_id, Some(user));
        assert_eq!(h.store.profile_writes().await, 1);

        let profile = h.store.profile(user).await.unwrap();
        assert_eq!(profile.billing_status, BillingStatus::Trial);
        assert!(profile.onboarding_completed);

        let row = h.store.user(user).await.unwrap();
        assert_eq!(row.subscription_status, UserSubscriptionStatus::Trialing);
        assert_eq!(row.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(row.stripe_customer_id.as_deref(), Some("cus_1"));
    }

    // =========================================================================
    // Onboarding patch wins over an active status for the same user
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_onboarding_wins_over_active() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        h.sync.complete_checkout("cus_1", Some(user)).await.unwrap();

        let profile = h.store.profile(user).await.unwrap();
        assert_eq!(profile.billing_status, BillingStatus::Trial);
        assert!(profile.onboarding_completed);
        assert_eq!(
            h.store.user(user).await.unwrap().subscription_status,
            UserSubscriptionStatus::Active
        );
    }

    // =========================================================================
    // Metadata names a different user than the mapping
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_different_onboarding_user() {
        let h = harness().await;
        let mapped = mapped_user(&h, "cus_1").await;
        let onboarding = Uuid::new_v4();
        h.store.seed_user(onboarding).await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        h.sync
            .complete_checkout("cus_1", Some(onboarding))
            .await
            .unwrap();

        let mapped_profile = h.store.profile(mapped).await.unwrap();
        assert_eq!(mapped_profile.billing_status, BillingStatus::Active);
        assert!(!mapped_profile.onboarding_completed);

        let onboarding_profile = h.store.profile(onboarding).await.unwrap();
        assert_eq!(onboarding_profile.billing_status, BillingStatus::Trial);
        assert!(onboarding_profile.onboarding_completed);
        assert_eq!(h.store.profile_writes().await, 2);
    }

    // =========================================================================
    // A read older than the stored row is dropped, projections untouched
    // =========================================================================
    #[tokio::test]
    async fn test_stale_read_does_not_overwrite() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;
        let mut newer = SubscriptionRecord::placeholder(
            "cus_1",
            OffsetDateTime::now_utc() + Duration::hours(1),
        );
        newer.status = SubscriptionStatus::Canceled;
        newer.subscription_id = Some("sub_1".to_string());
        h.store.seed_subscription(newer.clone()).await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        let outcome = h.sync.sync_customer("cus_1").await.unwrap();

        assert!(!outcome.record_applied);
        assert_eq!(h.store.subscription("cus_1").await.unwrap(), newer);
        assert_eq!(
            h.store.profile(user).await.unwrap().billing_status,
            BillingStatus::Pending
        );
        assert_eq!(h.store.profile_writes().await, 0);
    }

    // =========================================================================
    // Placeholder never outranks a real read
    // =========================================================================
    #[tokio::test]
    async fn test_placeholder_is_overwritten_by_first_read() {
        let h = harness().await;
        mapped_user(&h, "cus_1").await;
        assert!(h.store.ensure_subscription_placeholder("cus_1").await.unwrap());
        assert!(!h.store.ensure_subscription_placeholder("cus_1").await.unwrap());
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Trialing))
            .await;

        let outcome = h.sync.sync_customer("cus_1").await.unwrap();

        assert!(outcome.record_applied);
        let record = h.store.subscription("cus_1").await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::Trialing);
        assert_eq!(record.current_period_end, Some(1_738_368_000));
    }

    // =========================================================================
    // No subscription at the provider: not_started row, no projection
    // =========================================================================
    #[tokio::test]
    async fn test_no_subscription_writes_not_started_only() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;

        let outcome = h.sync.sync_customer("cus_1").await.unwrap();

        assert_eq!(outcome.status, SubscriptionStatus::NotStarted);
        assert_eq!(outcome.subscription_id, None);
        let record = h.store.subscription("cus_1").await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::NotStarted);
        assert_eq!(h.store.profile_writes().await, 0);
        assert_eq!(h.store.user(user).await.unwrap().stripe_customer_id, None);
    }

    // =========================================================================
    // Card details survive a read that returns no expanded payment method
    // =========================================================================
    #[tokio::test]
    async fn test_card_details_kept_without_expanded_method() {
        let h = harness().await;
        mapped_user(&h, "cus_1").await;
        let mut with_card = provider_subscription("sub_1", SubscriptionStatus::Active);
        with_card.payment_method = Some(CardSummary {
            brand: Some("visa".to_string()),
            last4: Some("4242".to_string()),
        });
        h.provider.set_subscription("cus_1", with_card).await;
        h.sync.sync_customer("cus_1").await.unwrap();

        let mut without_card = provider_subscription("sub_1", SubscriptionStatus::PastDue);
        without_card.payment_method = None;
        h.provider.set_subscription("cus_1", without_card).await;
        h.sync.sync_customer("cus_1").await.unwrap();

        let record = h.store.subscription("cus_1").await.unwrap();
        assert_eq!(record.status, SubscriptionStatus::PastDue);
        assert_eq!(record.payment_method_brand.as_deref(), Some("visa"));
        assert_eq!(record.payment_method_last4.as_deref(), Some("4242"));
    }

    // =========================================================================
    // Replaying the same event converges on the same state
    // =========================================================================
    #[tokio::test]
    async fn test_replay_converges() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        h.sync.sync_customer("cus_1").await.unwrap();
        let first = h.store.subscription("cus_1").await.unwrap();
        h.sync.sync_customer("cus_1").await.unwrap();
        let second = h.store.subscription("cus_1").await.unwrap();

        assert_eq!(
            SubscriptionRecord {
                updated_at: first.updated_at,
                ..second.clone()
            },
            first
        );
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(
            h.store.profile(user).await.unwrap().billing_status,
            BillingStatus::Active
        );
    }

    // =========================================================================
    // Customer without a live mapping: mirror only
    // =========================================================================
    #[tokio::test]
    async fn test_unmapped_customer_mirrors_without_projection() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;
        h.store.soft_delete_mapping("cus_1").await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        let outcome = h.sync.sync_customer("cus_1").await.unwrap();

        assert_eq!(outcome.user_id, None);
        assert_eq!(
            h.store.subscription("cus_1").await.unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(
            h.store.profile(user).await.unwrap().billing_status,
            BillingStatus::Pending
        );
    }

    // =========================================================================
    // Statuses outside the projected four land on pending
    // =========================================================================
    #[tokio::test]
    async fn test_unpaid_projects_to_pending() {
        let h = harness().await;
        let user = mapped_user(&h, "cus_1").await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Unpaid))
            .await;

        h.sync.sync_customer("cus_1").await.unwrap();

        assert_eq!(
            h.store.subscription("cus_1").await.unwrap().status,
            SubscriptionStatus::Unpaid
        );
        assert_eq!(
            h.store.profile(user).await.unwrap().billing_status,
            BillingStatus::Pending
        );
        assert_eq!(
            h.store.user(user).await.unwrap().subscription_status,
            UserSubscriptionStatus::None
        );
    }

    // =========================================================================
    // Missing profile row is logged, not an error
    // =========================================================================
    #[tokio::test]
    async fn test_missing_profile_row_is_not_fatal() {
        let h = harness().await;
        h.store.seed_mapping(Uuid::new_v4(), "cus_1").await;
        h.provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;

        let outcome = h.sync.sync_customer("cus_1").await.unwrap();
        assert!(outcome.record_applied);
        assert_eq!(h.store.profile_writes().await, 0);
    }

    // =========================================================================
    // Provider failure leaves the mirror untouched
    // =========================================================================
    #[tokio::test]
    async fn test_provider_failure_propagates() {
        let h = harness().await;
        mapped_user(&h, "cus_1").await;
        h.provider.fail_subscription_reads(true).await;

        let err = h.sync.sync_customer("cus_1").await.unwrap_err();

        assert!(matches!(err, BillingError::StripeApi(_)));
        assert!(h.store.subscription("cus_1").await.is_none());
    }

    // =========================================================================
    // Full reconciliation keeps going past failures
    // =========================================================================
    #[tokio::test]
    async fn test_sync_all_collects_failures() {
        let h = harness().await;
        mapped_user(&h, "cus_1").await;
        mapped_user(&h, "cus_2").await;
        h.provider.fail_subscription_reads(true).await;

        let summary = h.sync.sync_all().await.unwrap();

        assert_eq!(summary.customers, 2);
        assert_eq!(summary.synced, 0);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(h.provider.subscription_reads().await, 2);
    }

    #[tokio::test]
    async fn test_sync_all_counts_synced() {
        let h = harness().await;
        mapped_user(&h, "cus_1").await;
        mapped_user(&h, "cus_2").await;
        h.provider
            .set_subscription("cus_2", provider_subscription("sub_2", SubscriptionStatus::Active))
            .await;

        let summary = h.sync.sync_all().await.unwrap();

        assert_eq!(summary.synced, 2);
        assert!(summary.failed.is_empty());
    }

    #[tokio::test]
    async fn test_sync_user_without_mapping_is_not_found() {
        let h = harness().await;
        let err = h.sync.sync_user(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    // =========================================================================
    // View: none without mapping, not_started with mapping but no row
    // =========================================================================
    #[tokio::test]
    async fn test_view_for_user_states() {
        let h = harness().await;
        let stranger = Uuid::new_v4();
        let view = h.sync.view_for_user(stranger).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::None);
        assert_eq!(view.customer_id, None);

        let user = mapped_user(&h, "cus_1").await;
        let view = h.sync.view_for_user(user).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::NotStarted);
        assert_eq!(view.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(view.billing_status, Some(BillingStatus::Pending));
    }
}

#[cfg(test)]
mod webhook_flow_tests {
    use std::sync::Arc;

    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use uuid::Uuid;

    use crate::error::BillingError;
    use crate::models::{BillingStatus, SubscriptionStatus};
    use crate::subscriptions::SubscriptionSynchronizer;
    use crate::testing::{provider_subscription, InMemoryBillingStore, MockBillingProvider};
    use crate::webhooks::WebhookHandler;

    const SECRET: &str = "whsec_edge";
    const NOW: i64 = 1_700_000_000;

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn handler(
        provider: &Arc<MockBillingProvider>,
        store: &Arc<InMemoryBillingStore>,
    ) -> WebhookHandler {
        let sync = SubscriptionSynchronizer::new(provider.clone(), store.clone());
        WebhookHandler::new(SECRET.to_string(), 300, sync)
    }

    // =========================================================================
    // Signed checkout completion flows through to the profile
    // =========================================================================
    #[tokio::test]
    async fn test_signed_checkout_completion() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let user = Uuid::new_v4();
        store.seed_user(user).await;
        store.seed_mapping(user, "cus_1").await;
        provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Trialing))
            .await;

        let payload = serde_json::to_vec(&serde_json::json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "created": NOW,
            "data": {"object": {
                "id": "cs_1",
                "customer": "cus_1",
                "mode": "subscription",
                "metadata": {"user_id": user.to_string(), "trial_setup": "true"}
            }}
        }))
        .unwrap();
        let handler = handler(&provider, &store);

        let event = handler
            .verify_event_at(&payload, &sign(&payload, NOW), NOW)
            .unwrap();
        let outcome = handler.handle_event(&event).await.unwrap().unwrap();

        assert_eq!(outcome.status, SubscriptionStatus::Trialing);
        let profile = store.profile(user).await.unwrap();
        assert_eq!(profile.billing_status, BillingStatus::Trial);
        assert!(profile.onboarding_completed);
    }

    // =========================================================================
    // Tampered body fails before any provider call
    // =========================================================================
    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let payload = br#"{"id":"evt_1","type":"invoice.paid","data":{"object":{"customer":"cus_1"}}}"#;
        let header = sign(payload, NOW);
        let tampered = br#"{"id":"evt_1","type":"invoice.paid","data":{"object":{"customer":"cus_2"}}}"#;

        let err = handler(&provider, &store)
            .verify_event_at(tampered, &header, NOW)
            .unwrap_err();

        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert_eq!(provider.subscription_reads().await, 0);
    }

    // =========================================================================
    // Valid signature over a body that is not an event
    // =========================================================================
    #[tokio::test]
    async fn test_signed_non_event_is_invalid_payload() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let payload = b"not json";

        let err = handler(&provider, &store)
            .verify_event_at(payload, &sign(payload, NOW), NOW)
            .unwrap_err();

        assert!(matches!(err, BillingError::InvalidPayload(_)));
    }

    // =========================================================================
    // Irrelevant events never reach the provider
    // =========================================================================
    #[tokio::test]
    async fn test_one_off_payment_intent_ignored() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": "evt_pi",
            "type": "payment_intent.succeeded",
            "data": {"object": {"customer": "cus_1", "invoice": null}}
        }))
        .unwrap();
        let handler = handler(&provider, &store);

        let event = handler
            .verify_event_at(&payload, &sign(&payload, NOW), NOW)
            .unwrap();
        let outcome = handler.handle_event(&event).await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(provider.subscription_reads().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_metadata_user_still_syncs() {
        let provider = Arc::new(MockBillingProvider::new());
        let store = Arc::new(InMemoryBillingStore::new());
        let user = Uuid::new_v4();
        store.seed_user(user).await;
        store.seed_mapping(user, "cus_1").await;
        provider
            .set_subscription("cus_1", provider_subscription("sub_1", SubscriptionStatus::Active))
            .await;
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": "evt_bad_meta",
            "type": "checkout.session.completed",
            "data": {"object": {
                "customer": "cus_1",
                "mode": "subscription",
                "metadata": {"user_id": "not-a-uuid"}
            }}
        }))
        .unwrap();
        let handler = handler(&provider, &store);

        let event = handler
            .verify_event_at(&payload, &sign(&payload, NOW), NOW)
            .unwrap();
        handler.handle_event(&event).await.unwrap();

        let profile = store.profile(user).await.unwrap();
        assert_eq!(profile.billing_status, BillingStatus::Active);
        assert!(!profile.onboarding_completed);
    }
}

#[cfg(test)]
mod tier_boundary_tests {
    use crate::pricing::*;

    // =========================================================================
    // Tier edges: last position of one tier and first of the next
    // =========================================================================
    #[test]
    fn test_tier_edges() {
        let edges = [
            (1, 1399),
            (2, 1199),
            (3, 1199),
            (4, 999),
            (6, 999),
            (7, 799),
            (10, 799),
            (11, 599),
            (20, 599),
            (21, 399),
            (1000, 399),
        ];
        for (position, expected) in edges {
            assert_eq!(tier_price(position), expected, "position {}", position);
        }
    }

    #[test]
    fn test_position_zero_falls_back_to_last_tier() {
        assert_eq!(tier_price(0), 399);
    }

    #[test]
    fn test_twenty_first_parent_matches_child_rate() {
        let units: Vec<PricedUnit> = (1..=21).map(|p| PricedUnit::parent(Some(p))).collect();
        let with_child = [units.clone(), vec![PricedUnit::child()]].concat();

        let parents_only = calculate_hybrid_pricing(&units);
        let mixed = calculate_hybrid_pricing(&with_child);

        assert_eq!(
            mixed.total_monthly_cents - parents_only.total_monthly_cents,
            FLAT_CHILD_PRICE_CENTS
        );
        assert_eq!(mixed.bucket_b_cents, FLAT_CHILD_PRICE_CENTS);
    }
}
