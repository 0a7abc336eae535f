use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::server::{AppState, Authenticated};
use crate::subscriptions;

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub workspace_id: String,
    pub bead_id: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
}

/// Register interest in a bead's status changes. Idempotent.
pub async fn create(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<Value>> {
    let workspace = state
        .trust
        .bind_actor(&identity, &request.workspace_id)
        .await?;

    let subscription = subscriptions::subscribe(
        &state.db,
        &workspace,
        &request.bead_id,
        request.repo.as_deref(),
        request.event_type.as_deref(),
    )
    .await?;

    Ok(Json(json!({
        "subscription_id": subscription.subscription_id,
        "bead_id": subscription.bead_id,
        "repo": subscription.repo,
        "alias": subscription.alias,
        "event_type": subscription.event_type,
    })))
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace_id: String,
}

pub async fn list(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Query(query): Query<WorkspaceQuery>,
) -> ApiResult<Json<Value>> {
    let workspace = state.trust.bind_actor(&identity, &query.workspace_id).await?;
    let subscriptions = subscriptions::list(&state.db, &workspace).await?;
    Ok(Json(json!({ "subscriptions": subscriptions })))
}

pub async fn remove(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(subscription_id): Path<String>,
    Query(query): Query<WorkspaceQuery>,
) -> ApiResult<Json<Value>> {
    let workspace = state.trust.bind_actor(&identity, &query.workspace_id).await?;
    subscriptions::unsubscribe(&state.db, &workspace, &subscription_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}
