use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::auth::BoundWorkspace;
use crate::beads::{is_valid_bead_id, is_valid_canonical_origin};
use crate::db::Database;
use crate::error::{ApiError, ApiResult};

/// A workspace's interest registration in one bead's events.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub bead_id: String,
    pub repo: Option<String>,
    pub event_type: String,
    pub created_at: String,
}

/// True when the registration is a prefix pattern (`demo-*`) rather than an
/// exact bead id.
pub fn is_valid_bead_pattern(pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => !prefix.is_empty() && is_valid_bead_id(prefix),
        None => false,
    }
}

/// Does a registration (exact id or prefix pattern) cover this bead?
pub fn matches_bead(registration: &str, bead_id: &str) -> bool {
    match registration.strip_suffix('*') {
        Some(prefix) => bead_id.starts_with(prefix),
        None => registration == bead_id,
    }
}

/// Create a subscription for an exact bead id or a prefix pattern.
/// Idempotent: re-subscribing to the same (bead, repo, event_type) returns
/// the existing row.
pub async fn subscribe(
    db: &Database,
    workspace: &BoundWorkspace,
    bead_id: &str,
    repo: Option<&str>,
    event_type: Option<&str>,
) -> ApiResult<Subscription> {
    if !is_valid_bead_id(bead_id) && !is_valid_bead_pattern(bead_id) {
        return Err(ApiError::validation("invalid bead_id"));
    }
    if let Some(repo) = repo {
        if !is_valid_canonical_origin(repo) {
            return Err(ApiError::validation("invalid repo"));
        }
    }
    let event_type = event_type.unwrap_or("status_change");
    if event_type != "status_change" {
        return Err(ApiError::validation("unsupported event_type"));
    }

    sqlx::query(
        r#"
        INSERT INTO subscriptions
            (subscription_id, project_id, workspace_id, bead_id, repo, event_type, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&workspace.project_id)
    .bind(&workspace.workspace_id)
    .bind(bead_id)
    .bind(repo)
    .bind(event_type)
    .bind(Utc::now().to_rfc3339())
    .execute(db.pool())
    .await?;

    let row = sqlx::query(
        r#"
        SELECT subscription_id, project_id, workspace_id, bead_id, repo, event_type, created_at
        FROM subscriptions
        WHERE workspace_id = ?1 AND bead_id = ?2
          AND COALESCE(repo, '') = COALESCE(?3, '')
          AND event_type = ?4
        "#,
    )
    .bind(&workspace.workspace_id)
    .bind(bead_id)
    .bind(repo)
    .bind(event_type)
    .fetch_one(db.pool())
    .await?;

    Ok(from_row(&row, &workspace.alias))
}

pub async fn list(db: &Database, workspace: &BoundWorkspace) -> ApiResult<Vec<Subscription>> {
    let rows = sqlx::query(
        r#"
        SELECT subscription_id, project_id, workspace_id, bead_id, repo, event_type, created_at
        FROM subscriptions
        WHERE workspace_id = ?1
        ORDER BY created_at
        "#,
    )
    .bind(&workspace.workspace_id)
    .fetch_all(db.pool())
    .await?;
    Ok(rows
        .iter()
        .map(|row| from_row(row, &workspace.alias))
        .collect())
}

/// Remove a subscription. Only the owning workspace may remove it.
pub async fn unsubscribe(
    db: &Database,
    workspace: &BoundWorkspace,
    subscription_id: &str,
) -> ApiResult<()> {
    let row = sqlx::query("SELECT workspace_id FROM subscriptions WHERE subscription_id = ?1")
        .bind(subscription_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or(ApiError::NotFound("subscription"))?;

    let owner: String = row.get("workspace_id");
    if owner != workspace.workspace_id {
        return Err(ApiError::forbidden(
            "subscription belongs to another workspace",
        ));
    }

    sqlx::query("DELETE FROM subscriptions WHERE subscription_id = ?1")
        .bind(subscription_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

fn from_row(row: &sqlx::sqlite::SqliteRow, alias: &str) -> Subscription {
    Subscription {
        subscription_id: row.get("subscription_id"),
        project_id: row.get("project_id"),
        workspace_id: row.get("workspace_id"),
        alias: alias.to_string(),
        bead_id: row.get("bead_id"),
        repo: row.get("repo"),
        event_type: row.get("event_type"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patterns_require_a_valid_prefix() {
        assert!(is_valid_bead_pattern("demo-*"));
        assert!(is_valid_bead_pattern("bd*"));
        assert!(!is_valid_bead_pattern("*"));
        assert!(!is_valid_bead_pattern("-bad-*"));
        assert!(!is_valid_bead_pattern("demo-1"));
    }

    #[test]
    fn matching_covers_exact_ids_and_prefixes() {
        assert!(matches_bead("demo-42", "demo-42"));
        assert!(!matches_bead("demo-42", "demo-43"));
        assert!(matches_bead("demo-*", "demo-42"));
        assert!(matches_bead("demo-*", "demo-anything"));
        assert!(!matches_bead("demo-*", "other-1"));
    }
}
