//! Application state

use reqwest::Client;
use std::sync::Arc;

use priceye_billing::BillingService;

use crate::{auth::AuthState, config::Config, tasks::BackgroundTasks};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
    /// Webhook processing that outlives its request
    pub tasks: BackgroundTasks,
    auth: AuthState,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        // One HTTP client for Supabase token verification
        let http_client = Client::new();
        let auth = AuthState::new(
            &config.supabase_url,
            &config.supabase_service_role_key,
            http_client,
        );
        tracing::info!(
            "Supabase token verification enabled via {}",
            auth.supabase_url
        );

        Self {
            config,
            billing: Arc::new(billing),
            tasks: BackgroundTasks::new(),
            auth,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        self.auth.clone()
    }
}
