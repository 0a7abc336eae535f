use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::escalations;
use crate::server::{AppState, Authenticated};

#[derive(Debug, Deserialize)]
pub struct CreateEscalationRequest {
    pub workspace_id: String,
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
}

pub async fn create(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<CreateEscalationRequest>,
) -> ApiResult<Json<Value>> {
    let workspace = state
        .trust
        .bind_actor(&identity, &request.workspace_id)
        .await?;

    let timeout_seconds = request
        .timeout_seconds
        .or(Some(state.config.escalations.default_timeout_seconds as i64));

    let escalation = escalations::create(
        &state.db,
        &state.bus,
        &workspace,
        &request.subject,
        request.body.as_deref().unwrap_or(""),
        request.options,
        timeout_seconds,
    )
    .await?;

    Ok(Json(json!({
        "escalation_id": escalation.id,
        "status": escalation.status,
        "expires_at": escalation.expires_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    if let Some(status) = &query.status {
        if !["pending", "responded", "expired"].contains(&status.as_str()) {
            return Err(ApiError::validation("unknown escalation status"));
        }
    }
    let escalations =
        escalations::list(&state.db, &identity.project_id, query.status.as_deref()).await?;
    let escalations: Vec<Value> = escalations
        .iter()
        .map(|escalation| escalation_json(escalation, identity.is_public_reader()))
        .collect();
    Ok(Json(json!({ "escalations": escalations })))
}

pub async fn show(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(escalation_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let escalation = escalations::get(&state.db, &identity.project_id, &escalation_id).await?;
    Ok(Json(escalation_json(
        &escalation,
        identity.is_public_reader(),
    )))
}

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub response: String,
    #[serde(default)]
    pub responded_by: Option<String>,
}

pub async fn respond(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(escalation_id): Path<String>,
    Json(request): Json<RespondRequest>,
) -> ApiResult<Json<Value>> {
    if identity.is_public_reader() {
        return Err(ApiError::forbidden("public readers have read-only access"));
    }
    let responded_by = request
        .responded_by
        .clone()
        .or_else(|| identity.alias.clone())
        .unwrap_or_else(|| "human".to_string());

    let escalation = escalations::respond(
        &state.db,
        &state.bus,
        &identity.project_id,
        &escalation_id,
        &request.response,
        &responded_by,
    )
    .await?;

    Ok(Json(escalation_json(&escalation, false)))
}

fn escalation_json(escalation: &escalations::Escalation, redact: bool) -> Value {
    json!({
        "escalation_id": escalation.id,
        "workspace_id": escalation.workspace_id,
        "alias": escalation.alias,
        "subject": escalation.subject,
        "body": escalation.body,
        "options": escalation.options,
        "status": escalation.status,
        "response": escalation.response,
        "responded_by": if redact { None } else { escalation.responded_by.clone() },
        "responded_at": escalation.responded_at,
        "expires_at": escalation.expires_at,
        "created_at": escalation.created_at,
    })
}
