use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::beads::DEFAULT_BRANCH;
use crate::error::{ApiError, ApiResult};
use crate::server::{AppState, Authenticated};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub repo_origin: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
}

/// Attach a workspace to the authenticated identity (the bearer-mode
/// counterpart of first-contact init).
pub async fn register(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<Value>> {
    let agent_id = identity
        .agent_id
        .as_deref()
        .ok_or(ApiError::Unauthenticated)?;
    let alias = identity
        .alias
        .as_deref()
        .ok_or(ApiError::Unauthenticated)?;

    let outcome = state
        .bootstrap
        .register_workspace(
            &identity.project_id,
            agent_id,
            alias,
            None,
            &request.repo_origin,
            request.role.as_deref(),
            request.hostname.as_deref(),
            request.workspace_path.as_deref(),
        )
        .await?;

    state
        .presence
        .heartbeat(
            &outcome.workspace_id,
            &outcome.project_id,
            &outcome.canonical_origin,
            DEFAULT_BRANCH,
            &outcome.alias,
            request.role.as_deref().unwrap_or("agent"),
            request.hostname.as_deref(),
        )
        .await;

    Ok(Json(json!({
        "status": "ok",
        "project_id": outcome.project_id,
        "project_slug": outcome.project_slug,
        "repo_id": outcome.repo_id,
        "workspace_id": outcome.workspace_id,
        "canonical_origin": outcome.canonical_origin,
        "alias": outcome.alias,
        "workspace_created": outcome.workspace_created,
    })))
}

/// Soft-delete a workspace, releasing its claims and presence.
pub async fn remove(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace = state.trust.bind_actor(&identity, &workspace_id).await?;
    let released = state
        .bootstrap
        .delete_workspace(&state.engine, &state.presence, &workspace)
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "workspace_id": workspace_id,
        "released_claims": released,
    })))
}
