//! API server configuration

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Server settings read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Non-pooler URL for migrations; falls back to `database_url`
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub supabase_url: String,
    /// Sent as `apikey` when verifying user tokens
    pub supabase_service_role_key: String,
    pub run_migrations: bool,
    /// How long shutdown waits for webhook tasks still running
    pub task_drain_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            supabase_url: required("SUPABASE_URL")?,
            supabase_service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
            run_migrations: parse_bool("RUN_MIGRATIONS", true)?,
            task_drain_timeout: Duration::from_secs(parse_u64("TASK_DRAIN_TIMEOUT_SECS", 30)?),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => parse_bool_value(&value).ok_or(ConfigError::Invalid { name, value }),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}
