use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Worker configuration loaded from environment variables.
///
/// Loaded once at startup and immutable for the process lifetime. Missing
/// required values are startup-fatal; the process never enters the loop.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub portal_base_url: String,
    pub portal_username: String,
    pub portal_password: String,
    pub poll_interval_ms: u64,
    pub lock_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub retry_jitter_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            portal_base_url: env::var("AGENCY_PORTAL_BASE_URL")
                .unwrap_or_else(|_| "https://portal.dlr.state.example.gov".to_string()),
            portal_username: env::var("AGENCY_PORTAL_USERNAME")
                .context("AGENCY_PORTAL_USERNAME must be set")?,
            portal_password: env::var("AGENCY_PORTAL_PASSWORD")
                .context("AGENCY_PORTAL_PASSWORD must be set")?,
            poll_interval_ms: env_u64("POLL_INTERVAL_MS", 5_000)?,
            lock_timeout_ms: env_u64("LOCK_TIMEOUT_MS", 300_000)?,
            retry_max_attempts: env_u64("RETRY_MAX_ATTEMPTS", 4)? as u32,
            retry_initial_delay_ms: env_u64("RETRY_INITIAL_DELAY_MS", 2_000)?,
            retry_max_delay_ms: env_u64("RETRY_MAX_DELAY_MS", 30_000)?,
            retry_backoff_multiplier: env_u64("RETRY_BACKOFF_MULTIPLIER", 2)? as u32,
            retry_jitter_ms: env_u64("RETRY_JITTER_MS", 1_000)?,
            // Sized to exceed the worst-case single-job duration under full
            // retry exhaustion, so a deploy never drops an in-flight job.
            shutdown_timeout_ms: env_u64("SHUTDOWN_TIMEOUT_MS", 300_000)?,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Read an optional numeric variable, falling back to a default.
fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid integer", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serializes tests that mutate process environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const REQUIRED_VARS: [&str; 3] = [
        "DATABASE_URL",
        "AGENCY_PORTAL_USERNAME",
        "AGENCY_PORTAL_PASSWORD",
    ];

    fn sample_config() -> Config {
        Config {
            database_url: "postgres://localhost/worker".to_string(),
            port: 8080,
            portal_base_url: "http://localhost:9000".to_string(),
            portal_username: "steward".to_string(),
            portal_password: "secret".to_string(),
            poll_interval_ms: 5_000,
            lock_timeout_ms: 300_000,
            retry_max_attempts: 4,
            retry_initial_delay_ms: 2_000,
            retry_max_delay_ms: 30_000,
            retry_backoff_multiplier: 2,
            retry_jitter_ms: 1_000,
            shutdown_timeout_ms: 300_000,
        }
    }

    #[test]
    fn duration_accessors_convert_milliseconds() {
        let config = sample_config();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.lock_timeout(), Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn env_u64_returns_default_when_unset() {
        let value = env_u64("WORKER_TEST_UNSET_VARIABLE", 1_234).unwrap();
        assert_eq!(value, 1_234);
    }

    #[test]
    fn env_u64_rejects_non_numeric_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("WORKER_TEST_BAD_NUMBER", "not-a-number");
        let result = env_u64("WORKER_TEST_BAD_NUMBER", 0);
        env::remove_var("WORKER_TEST_BAD_NUMBER");
        assert!(result.is_err());
    }

    #[test]
    fn from_env_fails_without_database_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        for name in REQUIRED_VARS {
            env::remove_var(name);
        }

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn from_env_names_the_missing_portal_credential() {
        let _guard = ENV_LOCK.lock().unwrap();
        for name in REQUIRED_VARS {
            env::remove_var(name);
        }
        env::set_var("DATABASE_URL", "postgres://localhost/worker");

        let err = Config::from_env().unwrap_err();
        env::remove_var("DATABASE_URL");
        assert!(err.to_string().contains("AGENCY_PORTAL_USERNAME"));
    }
}
