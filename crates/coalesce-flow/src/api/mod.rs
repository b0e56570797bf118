//! Read-only HTTP API over the coalescing index and stats.
//!
//! ## Routes
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/health` | `{"status":"ok"}` |
//! | GET | `/v1/ping` | `{"status":"ok"}` |
//! | GET | `/v1/list` | `{"keys":[...]}` |
//! | GET | `/v1/list/:key` | `{"key":..., "jobs":[...], "size":n}` |
//! | GET | `/v1/stats` | `{"stats":{name: value}}` |
//! | GET | `/metrics` | Prometheus text format |
//!
//! A store failure answers 503 with a JSON error body. The API never
//! mutates the index.

pub mod error;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use coalesce_core::{CommonalityKey, JobId, KvStore};

use crate::index::CoalescingIndex;
use crate::stats::{StatsCounter, names};
use error::{ApiError, ApiResult};

/// Health and ping response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`.
    pub status: String,
}

/// Registered keys.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeysResponse {
    /// Sorted commonality keys.
    pub keys: Vec<CommonalityKey>,
}

/// One membership list.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    /// Commonality key.
    pub key: CommonalityKey,
    /// Pending jobs in arrival order.
    pub jobs: Vec<JobId>,
    /// Number of jobs.
    pub size: usize,
}

/// Stats counters.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Counter values by name.
    pub stats: BTreeMap<String, i64>,
}

/// Shared state for request handlers.
#[derive(Clone)]
pub struct ApiState {
    index: CoalescingIndex<dyn KvStore>,
    stats: StatsCounter<dyn KvStore>,
}

impl ApiState {
    /// Creates handler state.
    #[must_use]
    pub fn new(index: CoalescingIndex<dyn KvStore>, stats: StatsCounter<dyn KvStore>) -> Self {
        Self { index, stats }
    }
}

/// Builds the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ping", get(health))
        .route("/v1/list", get(list_keys))
        .route("/v1/list/:key", get(list_jobs))
        .route("/v1/stats", get(stats))
        .with_state(Arc::new(state))
        .merge(crate::metrics::metrics_router())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_keys(State(state): State<Arc<ApiState>>) -> ApiResult<Json<KeysResponse>> {
    let keys = state.index.keys().await?;
    Ok(Json(KeysResponse { keys }))
}

async fn list_jobs(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<ListResponse>> {
    let key = CommonalityKey::new(key).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let jobs = state.index.list(&key).await?;
    if jobs.is_empty() && !state.index.is_registered(&key).await? {
        return Err(ApiError::not_found(format!("no list for key '{key}'")));
    }
    Ok(Json(ListResponse {
        size: jobs.len(),
        key,
        jobs,
    }))
}

async fn stats(State(state): State<Arc<ApiState>>) -> ApiResult<Json<StatsResponse>> {
    let stats = state.stats.snapshot(names::ALL).await?;
    Ok(Json(StatsResponse { stats }))
}
