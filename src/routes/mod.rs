pub mod bdh;
pub mod escalations;
pub mod init;
pub mod policies;
pub mod status;
pub mod subscriptions;
pub mod workspaces;

use sqlx::Row;

use crate::auth::BoundWorkspace;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Canonical origin of the repo a workspace is attached to.
pub(crate) async fn repo_origin_for(
    state: &AppState,
    workspace: &BoundWorkspace,
) -> ApiResult<String> {
    let row = sqlx::query("SELECT canonical_origin FROM repos WHERE id = ?1")
        .bind(&workspace.repo_id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or(ApiError::NotFound("repo"))?;
    Ok(row.get("canonical_origin"))
}
