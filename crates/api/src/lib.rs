// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError carries provider error text
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! PricEye Billing API Library
//!
//! HTTP surface of the billing reconciliation service: checkout, the Stripe
//! webhook, subscription state and pricing.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
pub use tasks::BackgroundTasks;
