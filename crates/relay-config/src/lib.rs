//! Environment-driven configuration, loaded once at daemon startup.
//!
//! Follows the same shape as the teacher's `Config::from_env()`: `.env`
//! loaded via `dotenvy` for local development, required vars fail fast with
//! `anyhow::Context`, optional vars fall back to the defaults named in spec §6.

use anyhow::{Context, Result};
use std::env;

/// Application configuration loaded from environment variables (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres DSN backing the Job Store (C1) and Audit Log (C6).
    pub database_url: String,
    /// Redis endpoint backing the Queue Broker Adapter (C2).
    pub redis_url: String,
    /// Out-of-core rate limit referenced by the admin surface.
    pub high_volume_rate_limit: u32,
    /// Primary work queue name; defaults to `salesforce` (the `sfQueue`/
    /// `salesforce` queue named in spec §6).
    pub queue_name: String,
    /// Admin/monitor/handoff HTTP surface port.
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL").context("REDIS_URL must be set")?,
            high_volume_rate_limit: env::var("HIGH_VOLUME_RATE_LIMIT")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("HIGH_VOLUME_RATE_LIMIT must be a valid integer")?,
            queue_name: env::var("QUEUE_NAME").unwrap_or_else(|_| "salesforce".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in ["DATABASE_URL", "REDIS_URL", "HIGH_VOLUME_RATE_LIMIT", "QUEUE_NAME", "PORT"] {
            env::remove_var(key);
        }
    }

    #[test]
    fn missing_database_url_fails_fast() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("REDIS_URL", "redis://localhost:6379");
        let result = Config::from_env();
        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/relay");
        env::set_var("REDIS_URL", "redis://localhost:6379");

        let config = Config::from_env().unwrap();
        assert_eq!(config.high_volume_rate_limit, 1000);
        assert_eq!(config.queue_name, "salesforce");
        assert_eq!(config.port, 8080);
        clear_env();
    }
}
