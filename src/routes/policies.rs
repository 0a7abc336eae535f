use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::policies::{self, PolicyBundle, PolicyRecord};
use crate::server::{AppState, Authenticated};

fn record_json(record: &PolicyRecord) -> Value {
    json!({
        "policy_id": record.policy_id,
        "project_id": record.project_id,
        "version": record.version,
        "bundle": record.bundle,
        "created_by": record.created_by,
        "created_at": record.created_at,
        "is_active": record.is_active,
    })
}

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub only_selected: Option<bool>,
}

/// Active policy bundle, optionally narrowed to one role's playbook.
pub async fn active(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Query(query): Query<ActiveQuery>,
) -> ApiResult<Json<Value>> {
    let mut record = policies::get_active_policy(&state.db, &identity.project_id).await?;

    if let Some(role) = &query.role {
        if !record.bundle.roles.contains_key(role) {
            return Err(ApiError::validation(format!("unknown role '{role}'")));
        }
        if query.only_selected.unwrap_or(false) {
            record.bundle.roles.retain(|id, _| id == role);
        }
    } else if query.only_selected.unwrap_or(false) {
        return Err(ApiError::validation("only_selected requires a role"));
    }

    Ok(Json(record_json(&record)))
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub bundle: Value,
    #[serde(default)]
    pub base_policy_id: Option<String>,
}

/// Create and activate a new policy version. Returns 409 with the current
/// version when `base_policy_id` is stale.
pub async fn create(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<CreatePolicyRequest>,
) -> ApiResult<Json<Value>> {
    if identity.is_public_reader() {
        return Err(ApiError::forbidden("public readers have read-only access"));
    }

    let bundle: PolicyBundle = serde_json::from_value(request.bundle)
        .map_err(|err| ApiError::validation(format!("invalid policy bundle: {err}")))?;

    let created_by = identity
        .alias
        .clone()
        .or_else(|| identity.agent_id.clone());
    let record = policies::create_policy_version(
        &state.db,
        &identity.project_id,
        &bundle,
        request.base_policy_id.as_deref(),
        created_by.as_deref(),
    )
    .await?;

    Ok(Json(record_json(&record)))
}

/// All retained versions, newest first.
pub async fn list(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> ApiResult<Json<Value>> {
    let records = policies::list_policy_versions(&state.db, &identity.project_id).await?;
    let versions: Vec<Value> = records.iter().map(record_json).collect();
    Ok(Json(json!({ "policies": versions })))
}

pub async fn show(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(policy_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = policies::get_policy(&state.db, &identity.project_id, &policy_id).await?;
    Ok(Json(record_json(&record)))
}
