use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::Json;

use crate::beads::DEFAULT_BRANCH;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::workspaces::{InitOutcome, InitRequest};

/// Atomic bootstrap: project, repo, workspace, credential and default policy
/// in one transaction. Unauthenticated (it mints the credential), so it is
/// the one endpoint with an IP rate limit.
pub async fn init(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<InitRequest>,
) -> ApiResult<Json<InitOutcome>> {
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    if state.init_limiter.check_key(&client_ip).is_err() {
        return Err(ApiError::RateLimited {
            retry_after_seconds: state.config.server.init_rate_window_seconds,
        });
    }

    let hostname = request.hostname.clone();
    let role = request
        .role
        .as_deref()
        .map(crate::workspaces::normalize_role)
        .unwrap_or_else(|| "agent".to_string());

    let outcome = state.bootstrap.init(&request).await?;

    state
        .presence
        .heartbeat(
            &outcome.workspace_id,
            &outcome.project_id,
            &outcome.canonical_origin,
            DEFAULT_BRANCH,
            &outcome.alias,
            &role,
            hostname.as_deref(),
        )
        .await;

    Ok(Json(outcome))
}
