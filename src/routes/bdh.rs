use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::beads::{is_valid_branch_name, parse_items_jsonl, SyncMode, SyncOutcome, DEFAULT_BRANCH};
use crate::error::{ApiError, ApiResult};
use crate::policies;
use crate::server::{AppState, Authenticated};
use crate::workspaces::canonicalize_git_url;

use super::repo_origin_for;

#[derive(Debug, Deserialize)]
pub struct BdhSyncRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub repo_origin: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub issues_jsonl: Option<String>,
    #[serde(default)]
    pub changed_issues: Option<String>,
    #[serde(default)]
    pub deleted_ids: Vec<String>,
    #[serde(default)]
    pub command_line: Option<String>,
}

/// Full or incremental work-item sync for one repo/branch scope.
pub async fn sync(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<BdhSyncRequest>,
) -> ApiResult<Json<SyncOutcome>> {
    if identity.is_public_reader() {
        return Err(ApiError::forbidden("public readers have read-only access"));
    }
    let workspace = state.trust.bind_actor(&identity, &request.workspace_id).await?;

    let branch = request
        .branch
        .clone()
        .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
    if !is_valid_branch_name(&branch) {
        return Err(ApiError::validation("invalid branch name"));
    }

    let repo = match &request.repo_origin {
        Some(origin) => canonicalize_git_url(origin)?,
        None => repo_origin_for(&state, &workspace).await?,
    };

    let payload = match request.sync_mode {
        SyncMode::Full => request
            .issues_jsonl
            .as_deref()
            .ok_or_else(|| ApiError::validation("issues_jsonl is required for a full sync"))?,
        SyncMode::Incremental => request.changed_issues.as_deref().unwrap_or(""),
    };
    let items = parse_items_jsonl(payload);

    // Claim-sharing is a policy decision; resolve it before the transaction.
    let allow_coordinated = policies::get_active_policy(&state.db, &workspace.project_id)
        .await?
        .bundle
        .settings
        .allow_coordinated_claims;

    let outcome = state
        .engine
        .sync(
            &workspace,
            &repo,
            &branch,
            items,
            &request.deleted_ids,
            allow_coordinated,
        )
        .await?;

    state
        .presence
        .heartbeat(
            &workspace.workspace_id,
            &workspace.project_id,
            &repo,
            &branch,
            &workspace.alias,
            &workspace.role,
            None,
        )
        .await;

    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct BdhCommandRequest {
    pub workspace_id: String,
    #[serde(default)]
    pub command_line: Option<String>,
}

/// Pre-command check-in from the client: verifies the workspace is alive
/// (410 once deleted), heartbeats presence, and returns coordination context
/// for the agent to act on.
pub async fn command(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<BdhCommandRequest>,
) -> ApiResult<Json<Value>> {
    let workspace = state.trust.bind_actor(&identity, &request.workspace_id).await?;

    let repo = repo_origin_for(&state, &workspace).await?;
    state
        .presence
        .heartbeat(
            &workspace.workspace_id,
            &workspace.project_id,
            &repo,
            DEFAULT_BRANCH,
            &workspace.alias,
            &workspace.role,
            None,
        )
        .await;

    let beads_in_progress = state.engine.in_progress_beads(&workspace.project_id).await?;
    let policy = policies::get_active_policy(&state.db, &workspace.project_id).await?;
    let pending_escalations =
        crate::escalations::pending_count(&state.db, &workspace.project_id).await?;

    if let Some(command_line) = &request.command_line {
        tracing::debug!(
            alias = %workspace.alias,
            command = %command_line,
            "bdh command check-in"
        );
    }

    Ok(Json(json!({
        "approved": true,
        "context": {
            "beads_in_progress": beads_in_progress,
            "policy_version": policy.version,
            "pending_escalations": pending_escalations,
        },
    })))
}

/// Active claims held by the calling identity's workspaces.
pub async fn claims(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> ApiResult<Json<Value>> {
    let workspace_ids: Vec<String> = match (&identity.agent_id, &identity.actor_workspace_id) {
        (Some(agent_id), _) => {
            use sqlx::Row;
            sqlx::query(
                "SELECT workspace_id FROM workspaces WHERE agent_id = ?1 AND deleted_at IS NULL",
            )
            .bind(agent_id)
            .fetch_all(state.db.pool())
            .await?
            .iter()
            .map(|row| row.get("workspace_id"))
            .collect()
        }
        (None, Some(actor)) => vec![actor.clone()],
        (None, None) => {
            return Err(ApiError::forbidden("claims require a workspace identity"))
        }
    };

    let mut claims = Vec::new();
    for workspace_id in &workspace_ids {
        claims.extend(state.engine.claims_for_workspace(workspace_id).await?);
    }

    Ok(Json(json!({ "claims": claims })))
}
