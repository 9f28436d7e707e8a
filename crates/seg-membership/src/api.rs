//! Segments HTTP API
//!
//! REST endpoints for segment and membership management, plus health probes.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::entity::Membership;
use crate::error::SegmentError;
use crate::service::{SegmentService, SegmentSummary, Subscription};

/// Create segment request
#[derive(Debug, Deserialize)]
pub struct CreateSegmentRequest {
    pub name: String,
}

/// Add user to segment request
#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    #[serde(rename = "user-id")]
    pub user_id: i64,

    #[serde(rename = "segment-name")]
    pub segment_name: String,

    /// 0 subscribes permanently
    #[serde(rename = "timeout-hours", default)]
    pub timeout_hours: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSegmentQuery {
    pub segment_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveUserQuery {
    pub user_id: i64,
    pub segment_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub armed_timers: usize,
}

#[derive(Debug, Serialize)]
struct ProbeResponse {
    status: &'static str,
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SegmentService>,
}

impl AppState {
    pub fn new(service: Arc<SegmentService>) -> Self {
        Self { service }
    }
}

impl From<JsonRejection> for SegmentError {
    fn from(rejection: JsonRejection) -> Self {
        SegmentError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for SegmentError {
    fn from(rejection: QueryRejection) -> Self {
        SegmentError::validation(rejection.body_text())
    }
}

impl From<PathRejection> for SegmentError {
    fn from(rejection: PathRejection) -> Self {
        SegmentError::validation(rejection.body_text())
    }
}

fn required(value: &str, field: &str) -> Result<(), SegmentError> {
    if value.trim().is_empty() {
        return Err(SegmentError::validation(format!("{field} is required")));
    }
    Ok(())
}

pub async fn create_segment(
    State(state): State<AppState>,
    body: Result<Json<CreateSegmentRequest>, JsonRejection>,
) -> Result<StatusCode, SegmentError> {
    let Json(req) = body?;
    required(&req.name, "name")?;

    state.service.create_segment(&req.name).await?;
    Ok(StatusCode::CREATED)
}

pub async fn delete_segment(
    State(state): State<AppState>,
    query: Result<Query<DeleteSegmentQuery>, QueryRejection>,
) -> Result<StatusCode, SegmentError> {
    let Query(query) = query?;
    let name = query.segment_name.unwrap_or_default();
    required(&name, "segmentName")?;

    state.service.delete_segment(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_user(
    State(state): State<AppState>,
    body: Result<Json<AddUserRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Subscription>), SegmentError> {
    let Json(req) = body?;

    if req.user_id <= 0 {
        return Err(SegmentError::validation("user-id must be positive"));
    }
    required(&req.segment_name, "segment-name")?;
    let timeout_hours = u32::try_from(req.timeout_hours).map_err(|_| {
        SegmentError::validation("timeout-hours must be a non-negative number of hours")
    })?;

    let subscription = state
        .service
        .subscribe_user(req.user_id, &req.segment_name, timeout_hours)
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn remove_user(
    State(state): State<AppState>,
    query: Result<Query<RemoveUserQuery>, QueryRejection>,
) -> Result<StatusCode, SegmentError> {
    let Query(query) = query?;
    required(&query.segment_name, "segmentName")?;

    state
        .service
        .unsubscribe_user(query.user_id, &query.segment_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_segment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SegmentSummary>, SegmentError> {
    Ok(Json(state.service.find_segment(&name).await?))
}

pub async fn user_segments(
    State(state): State<AppState>,
    user_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Vec<Membership>>, SegmentError> {
    let Path(user_id) = user_id?;
    Ok(Json(state.service.user_memberships(user_id).await?))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        version: seg_common::VERSION,
        armed_timers: state.service.expiry().armed_count(),
    })
}

async fn probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "UP" })
}

/// Build the segments router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/segment/create", post(create_segment))
        .route("/segment/delete", delete(delete_segment))
        .route("/segment/addUser", post(add_user))
        .route("/segment/removeUser", delete(remove_user))
        .route("/segment/{name}", get(get_segment))
        .route("/users/{user_id}/segments", get(user_segments))
        .route("/q/health", get(health))
        .route("/q/health/live", get(probe))
        .route("/q/health/ready", get(probe))
        .with_state(state)
}
