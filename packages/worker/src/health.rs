//! Health and shutdown surface.
//!
//! [`WorkerState`] is the small process-scoped state shared between the
//! dispatcher (its one writer), the health endpoint, and the signal
//! handler. The endpoint is purely observational; liveness probes poll it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Live process state: current job, shutdown flag, uptime.
pub struct WorkerState {
    started_at: Instant,
    current_job: RwLock<Option<Uuid>>,
    shutdown: CancellationToken,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            current_job: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn set_current_job(&self, job_id: Option<Uuid>) {
        *self.current_job.write().await = job_id;
    }

    pub async fn current_job(&self) -> Option<Uuid> {
        *self.current_job.read().await
    }

    /// Flip the shutdown flag. The dispatcher observes it at the next
    /// iteration boundary and stops claiming new jobs.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    current_job: Option<Uuid>,
    is_shutting_down: bool,
    uptime_secs: u64,
}

/// Health endpoint router.
pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<WorkerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        current_job: state.current_job().await,
        is_shutting_down: state.is_shutting_down(),
        uptime_secs: state.uptime().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_tracks_current_job() {
        let state = WorkerState::new();
        assert_eq!(state.current_job().await, None);

        let job_id = Uuid::new_v4();
        state.set_current_job(Some(job_id)).await;
        assert_eq!(state.current_job().await, Some(job_id));

        state.set_current_job(None).await;
        assert_eq!(state.current_job().await, None);
    }

    #[tokio::test]
    async fn shutdown_flag_is_sticky_and_awaitable() {
        let state = Arc::new(WorkerState::new());
        assert!(!state.is_shutting_down());

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.shutdown_requested().await })
        };

        state.request_shutdown();
        waiter.await.unwrap();
        assert!(state.is_shutting_down());
    }

    #[tokio::test]
    async fn health_handler_reports_state() {
        let state = Arc::new(WorkerState::new());
        let job_id = Uuid::new_v4();
        state.set_current_job(Some(job_id)).await;

        let Json(response) = health_handler(State(state.clone())).await;
        assert_eq!(response.status, "ok");
        assert_eq!(response.current_job, Some(job_id));
        assert!(!response.is_shutting_down);

        state.request_shutdown();
        let Json(response) = health_handler(State(state)).await;
        assert!(response.is_shutting_down);
    }
}
