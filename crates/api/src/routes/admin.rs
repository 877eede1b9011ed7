//! Admin routes, protected by the `ADMIN_API_TOKEN` bearer token

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
    Json,
};
use keepwarden_access::ReconciliationResult;
use keepwarden_shared::ManagedRole;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn require_admin_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        tracing::warn!(path = %request.uri().path(), "Admin request rejected: ADMIN_API_TOKEN not configured");
        return Err(ApiError::Unauthorized);
    };
    let provided = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "Admin request rejected: invalid token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// POST /admin/reconcile - run detection (and fixes, if enabled) now
///
/// Ignores `RECONCILIATION_PAUSED` and maintenance mode.
pub async fn trigger_reconciliation(
    State(state): State<AppState>,
) -> ApiResult<Json<ReconciliationResult>> {
    tracing::info!("Manual reconciliation requested");
    let result = state.services.reconciler.run_manual().await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub platform_user_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub member_id: Uuid,
    pub platform_user_id: String,
    pub expected_role: Option<ManagedRole>,
    /// Queued role grant, if any
    pub task_id: Option<u64>,
}

/// POST /admin/members/{id}/claim - link a member to their platform account
pub async fn claim_member(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    let platform_user_id = req.platform_user_id.trim();
    if platform_user_id.is_empty() {
        return Err(ApiError::Validation(
            "platform_user_id must not be empty".to_string(),
        ));
    }

    let claim = state
        .services
        .claims
        .claim(member_id, platform_user_id)
        .await?;

    Ok(Json(ClaimResponse {
        member_id,
        platform_user_id: platform_user_id.to_string(),
        expected_role: claim.expected_role,
        task_id: claim.task.as_ref().map(|t| t.id()),
    }))
}
