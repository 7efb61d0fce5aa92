//! Test harness with testcontainers for integration testing.
//!
//! One shared Postgres container is started on first use and reused by the
//! whole test run. Each test gets its own freshly created database with
//! migrations applied, so tests that exercise the shared job queue cannot
//! claim each other's rows.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedInfra {
    base_url: String,
    admin_pool: PgPool,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgresql://postgres:postgres@{}:{}", host, port);

        let admin_pool = PgPool::connect(&format!("{}/postgres", base_url))
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self {
            base_url,
            admin_pool,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// A pool connected to a fresh database with migrations applied.
pub async fn fresh_pool() -> PgPool {
    let infra = SharedInfra::get().await;

    let db_name = format!("worker_test_{}", Uuid::new_v4().simple());
    sqlx::query(&format!(r#"CREATE DATABASE "{}""#, db_name))
        .execute(&infra.admin_pool)
        .await
        .expect("Failed to create test database");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&format!("{}/{}", infra.base_url, db_name))
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}
