use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::Row;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{ApiError, ApiResult};
use crate::policies;
use crate::presence::PresenceFilter;
use crate::server::{AppState, Authenticated};

/// Liveness plus a database ping.
pub async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .db
        .health_check()
        .await
        .map_err(|_| ApiError::Unavailable)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Project snapshot: who is online, what is in flight, what needs a human.
pub async fn snapshot(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> ApiResult<Json<Value>> {
    let project_id = &identity.project_id;

    let project = sqlx::query("SELECT slug, name, visibility FROM projects WHERE id = ?1")
        .bind(project_id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or(ApiError::NotFound("project"))?;

    let online = state
        .presence
        .lookup(&PresenceFilter {
            project_id: project_id.clone(),
            ..Default::default()
        })
        .await;
    let redact = identity.is_public_reader();
    let online: Vec<Value> = online
        .iter()
        .map(|record| {
            json!({
                "workspace_id": record.workspace_id,
                "repo": record.repo,
                "branch": record.branch,
                "alias": record.alias,
                "role": record.role,
                "hostname": if redact { None } else { record.hostname.clone() },
                "last_seen": record.last_seen,
            })
        })
        .collect();

    let beads_in_progress = state.engine.in_progress_beads(project_id).await?;
    let pending_escalations = crate::escalations::pending_count(&state.db, project_id).await?;
    let outbox = crate::outbox::counts(&state.db, project_id).await?;
    let policy = policies::get_active_policy(&state.db, project_id).await?;

    Ok(Json(json!({
        "project": {
            "id": project_id,
            "slug": project.get::<String, _>("slug"),
            "name": project.get::<String, _>("name"),
            "visibility": project.get::<String, _>("visibility"),
        },
        "online": online,
        "beads_in_progress": beads_in_progress,
        "pending_escalations": pending_escalations,
        "outbox": outbox,
        "policy": { "policy_id": policy.policy_id, "version": policy.version },
    })))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated event categories to include (e.g. "bead,escalation").
    #[serde(default)]
    pub types: Option<String>,
}

/// SSE stream of this project's events. Delivery is best-effort: a lagging
/// consumer misses events and catches up from the snapshot endpoint.
pub async fn stream(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let project_id = identity.project_id.clone();
    let categories: Option<HashSet<String>> = query.types.map(|types| {
        types
            .split(',')
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    });

    let receiver = state.bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |event| {
        let project_id = project_id.clone();
        let categories = categories.clone();
        async move {
            let event = event.ok()?;
            if event.project_id != project_id {
                return None;
            }
            if let Some(categories) = &categories {
                if !categories.contains(&event.category()) {
                    return None;
                }
            }
            Some(Ok(SseEvent::default().data(event.to_json().to_string())))
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    )
}
