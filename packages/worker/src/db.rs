//! Shared database handle.
//!
//! One `PgPool` per process, created lazily on first use and cached. All
//! lease, status, and event-log operations go through this handle. Retry for
//! store calls is layered on top by callers; the pool itself does none.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::config::Config;

static POOL: OnceLock<Mutex<Option<PgPool>>> = OnceLock::new();

fn cell() -> &'static Mutex<Option<PgPool>> {
    POOL.get_or_init(|| Mutex::new(None))
}

/// Get the shared pool, connecting on first call.
pub async fn pool(config: &Config) -> Result<PgPool> {
    let mut guard = cell().lock().await;
    if let Some(pool) = guard.as_ref() {
        return Ok(pool.clone());
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    *guard = Some(pool.clone());
    Ok(pool)
}

/// Drop and close the cached pool. Safe to call when no pool exists.
pub async fn close() {
    let mut guard = cell().lock().await;
    if let Some(pool) = guard.take() {
        pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_without_a_pool() {
        close().await;
        close().await;
    }
}
