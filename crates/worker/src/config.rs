//! Worker settings

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
}

pub const DEFAULT_RECONCILE_CRON: &str = "0 0 */6 * * *";
pub const DEFAULT_INVARIANT_CRON: &str = "0 0 4 * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    /// Full Stripe re-sync of every mapped customer
    pub reconcile_cron: String,
    pub invariant_cron: String,
    /// Run one reconciliation immediately instead of waiting for the schedule
    pub reconcile_on_start: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing("DATABASE_URL"))?,
            reconcile_cron: cron_or_default("RECONCILE_CRON", DEFAULT_RECONCILE_CRON),
            invariant_cron: cron_or_default("INVARIANT_CRON", DEFAULT_INVARIANT_CRON),
            reconcile_on_start: std::env::var("RECONCILE_ON_START")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }
}

fn cron_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
