use std::sync::Arc;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::auth::BoundWorkspace;
use crate::beads::{is_valid_alias, is_valid_canonical_origin, is_valid_human_name, SyncEngine};
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::identity::IdentityAccess;
use crate::policies;
use crate::presence::PresenceCache;

// Classic names for alias generation (alice, bob, charlie, ...)
const CLASSIC_NAMES: &[&str] = &[
    "alice", "bob", "charlie", "dave", "eve", "frank", "grace", "henry", "ivy", "jack", "kate",
    "leo", "mia", "noah", "olivia", "peter", "quinn", "rose", "sam", "tara", "uma", "victor",
    "wendy", "xavier", "yara", "zoe",
];

const ROLE_MAX_LENGTH: usize = 50;
const ROLE_MAX_WORDS: usize = 2;

static ROLE_WORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").unwrap());
static SSH_ORIGIN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^git@([^:]+):(.+)$").unwrap());
static SLUG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,63}$").unwrap());

/// Normalize a role: trimmed, single-spaced, lowercase.
pub fn normalize_role(role: &str) -> String {
    role.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Roles are 1-2 words of `[a-zA-Z0-9_-]`, at most 50 chars.
pub fn is_valid_role(role: &str) -> bool {
    let normalized = normalize_role(role);
    if normalized.is_empty() || normalized.len() > ROLE_MAX_LENGTH {
        return false;
    }
    let words: Vec<&str> = normalized.split(' ').collect();
    if words.len() > ROLE_MAX_WORDS {
        return false;
    }
    words.iter().all(|word| ROLE_WORD_PATTERN.is_match(word))
}

pub fn role_to_alias_prefix(role: &str) -> String {
    normalize_role(role).replace(' ', "-")
}

pub fn is_valid_slug(slug: &str) -> bool {
    SLUG_PATTERN.is_match(slug)
}

/// Printable single-line metadata (hostname, workspace path).
fn is_clean_metadata(value: &str, max_len: usize) -> bool {
    !value.is_empty() && value.len() <= max_len && !value.chars().any(char::is_control)
}

/// Normalize a git origin URL to `host/path` canonical form.
///
/// Handles `git@host:org/repo.git`, `https://host/org/repo.git` and
/// `ssh://git@host:22/org/repo.git`; strips the `.git` suffix and trailing
/// slashes.
pub fn canonicalize_git_url(origin_url: &str) -> ApiResult<String> {
    let url = origin_url.trim();
    if url.is_empty() {
        return Err(ApiError::validation("empty origin URL"));
    }

    let (host, path) = if let Some(captures) = SSH_ORIGIN_PATTERN.captures(url) {
        (captures[1].to_string(), captures[2].to_string())
    } else {
        let parsed = url::Url::parse(url)
            .map_err(|_| ApiError::validation(format!("invalid git URL: {origin_url}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ApiError::validation(format!("invalid git URL: {origin_url}")))?;
        (host.to_string(), parsed.path().trim_start_matches('/').to_string())
    };

    let path = path.strip_suffix(".git").unwrap_or(&path);
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return Err(ApiError::validation(format!(
            "invalid git URL (no path): {origin_url}"
        )));
    }

    let canonical = format!("{host}/{path}");
    if !is_valid_canonical_origin(&canonical) {
        return Err(ApiError::validation(format!(
            "invalid git URL: {origin_url}"
        )));
    }
    Ok(canonical)
}

/// Repo name is the last path component of the canonical origin.
pub fn extract_repo_name(canonical_origin: &str) -> String {
    canonical_origin
        .rsplit('/')
        .next()
        .unwrap_or(canonical_origin)
        .to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    pub project_slug: Option<String>,
    pub project_name: Option<String>,
    pub repo_origin: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub human_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub workspace_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    pub status: &'static str,
    pub api_key: String,
    pub created: bool,
    pub workspace_created: bool,
    pub project_id: String,
    pub project_slug: String,
    pub agent_id: String,
    pub repo_id: String,
    pub workspace_id: String,
    pub canonical_origin: String,
    pub alias: String,
    pub policy_version: i64,
    pub created_at: String,
}

/// Atomic first-contact provisioning: project, repo, workspace, credential
/// and default policy either all exist after the call or none of the new
/// rows survive.
#[derive(Clone)]
pub struct Bootstrap {
    db: Database,
    identity: Arc<dyn IdentityAccess>,
}

impl Bootstrap {
    pub fn new(db: Database, identity: Arc<dyn IdentityAccess>) -> Self {
        Self { db, identity }
    }

    pub async fn init(&self, request: &InitRequest) -> ApiResult<InitOutcome> {
        let role = match &request.role {
            Some(role) if !is_valid_role(role) => {
                return Err(ApiError::validation("invalid role"));
            }
            Some(role) => normalize_role(role),
            None => "agent".to_string(),
        };
        if let Some(alias) = &request.alias {
            if !is_valid_alias(alias) {
                return Err(ApiError::validation("invalid alias"));
            }
        }
        if let Some(human_name) = &request.human_name {
            if !is_valid_human_name(human_name) {
                return Err(ApiError::validation("invalid human_name"));
            }
        }
        if let Some(hostname) = &request.hostname {
            if !is_clean_metadata(hostname, 255) {
                return Err(ApiError::validation("invalid hostname"));
            }
        }
        if let Some(path) = &request.workspace_path {
            if !is_clean_metadata(path, 1024) {
                return Err(ApiError::validation("invalid workspace_path"));
            }
        }

        let canonical_origin = canonicalize_git_url(&request.repo_origin)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.db.pool().begin().await?;

        // Project: look up by slug, create on first contact.
        let slug = request.project_slug.as_deref().map(str::trim);
        let existing_project = match slug {
            Some(slug) => {
                sqlx::query("SELECT id, slug FROM projects WHERE tenant_id IS NULL AND slug = ?1")
                    .bind(slug)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };

        let (project_id, project_slug, project_created) = match existing_project {
            Some(row) => (row.get("id"), row.get("slug"), false),
            None => {
                let slug = slug.ok_or_else(|| {
                    ApiError::validation("project_slug is required for a new project")
                })?;
                if !is_valid_slug(slug) {
                    return Err(ApiError::validation("invalid project_slug"));
                }
                let project_id = Uuid::new_v4().to_string();
                let name = request.project_name.as_deref().unwrap_or(slug);
                sqlx::query(
                    r#"
                    INSERT INTO projects (id, slug, name, visibility, policy_seq, created_at)
                    VALUES (?1, ?2, ?3, 'private', 0, ?4)
                    "#,
                )
                .bind(&project_id)
                .bind(slug)
                .bind(name)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                (project_id, slug.to_string(), true)
            }
        };

        // Repo: keyed by canonical origin within the project.
        let existing_repo =
            sqlx::query("SELECT id FROM repos WHERE project_id = ?1 AND canonical_origin = ?2")
                .bind(&project_id)
                .bind(&canonical_origin)
                .fetch_optional(&mut *tx)
                .await?;
        let repo_id = match existing_repo {
            Some(row) => row.get("id"),
            None => {
                let repo_id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO repos (id, project_id, canonical_origin, name, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(&repo_id)
                .bind(&project_id)
                .bind(&canonical_origin)
                .bind(extract_repo_name(&canonical_origin))
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                repo_id
            }
        };

        // Workspace: reuse the live workspace with this alias if it matches,
        // otherwise mint agent + credential + workspace together.
        let alias_lookup = match &request.alias {
            Some(alias) => sqlx::query(
                r#"
                SELECT workspace_id, repo_id, agent_id, alias
                FROM workspaces
                WHERE project_id = ?1 AND alias = ?2 AND deleted_at IS NULL
                "#,
            )
            .bind(&project_id)
            .bind(alias)
            .fetch_optional(&mut *tx)
            .await?,
            None => None,
        };

        let (workspace_id, agent_id, alias, workspace_created) = match alias_lookup {
            Some(row) => {
                let existing_repo_id: String = row.get("repo_id");
                if existing_repo_id != repo_id {
                    return Err(ApiError::validation(
                        "alias is already in use for a different repo",
                    ));
                }
                (
                    row.get("workspace_id"),
                    row.get("agent_id"),
                    row.get("alias"),
                    false,
                )
            }
            None => {
                let alias = match &request.alias {
                    Some(alias) => alias.clone(),
                    None => suggest_alias(&mut tx, &project_id, &role).await?,
                };
                let agent_id = self
                    .identity
                    .create_agent(
                        &mut *tx,
                        &project_id,
                        &alias,
                        request.human_name.as_deref(),
                        "agent",
                    )
                    .await?;
                let workspace_id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO workspaces
                        (workspace_id, project_id, repo_id, agent_id, alias, role,
                         human_name, hostname, workspace_path, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                )
                .bind(&workspace_id)
                .bind(&project_id)
                .bind(&repo_id)
                .bind(&agent_id)
                .bind(&alias)
                .bind(&role)
                .bind(&request.human_name)
                .bind(&request.hostname)
                .bind(&request.workspace_path)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                (workspace_id, agent_id, alias, true)
            }
        };

        let api_key = self.identity.issue_api_key(&mut *tx, &agent_id).await?;

        // Default policy rides the same transaction: a half-provisioned
        // project with no policy must not survive a failure here.
        let policy_version = match policies::create_version_in(
            &mut tx,
            &project_id,
            policies::default_bundle(),
            None,
            Some("system"),
        )
        .await
        {
            Ok(record) => record.version,
            Err(ApiError::PolicyConflict { current_version, .. }) => current_version,
            Err(err) => return Err(err),
        };

        tx.commit().await?;

        tracing::info!(
            project_slug = %project_slug,
            alias = %alias,
            created = project_created,
            workspace_created,
            "bootstrap completed"
        );

        Ok(InitOutcome {
            status: "ok",
            api_key,
            created: project_created,
            workspace_created,
            project_id,
            project_slug,
            agent_id,
            repo_id,
            workspace_id,
            canonical_origin,
            alias,
            policy_version,
            created_at: now,
        })
    }

    /// Attach a workspace to an already-authenticated identity (explicit
    /// registration, as opposed to first-contact init).
    pub async fn register_workspace(
        &self,
        project_id: &str,
        agent_id: &str,
        agent_alias: &str,
        human_name: Option<&str>,
        repo_origin: &str,
        role: Option<&str>,
        hostname: Option<&str>,
        workspace_path: Option<&str>,
    ) -> ApiResult<InitOutcome> {
        let role = match role {
            Some(role) if !is_valid_role(role) => {
                return Err(ApiError::validation("invalid role"))
            }
            Some(role) => normalize_role(role),
            None => "agent".to_string(),
        };
        let canonical_origin = canonicalize_git_url(repo_origin)?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.db.pool().begin().await?;

        let project = sqlx::query("SELECT slug FROM projects WHERE id = ?1")
            .bind(project_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApiError::NotFound("project"))?;
        let project_slug: String = project.get("slug");

        let existing_repo =
            sqlx::query("SELECT id FROM repos WHERE project_id = ?1 AND canonical_origin = ?2")
                .bind(project_id)
                .bind(&canonical_origin)
                .fetch_optional(&mut *tx)
                .await?;
        let repo_id: String = match existing_repo {
            Some(row) => row.get("id"),
            None => {
                let repo_id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO repos (id, project_id, canonical_origin, name, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .bind(&repo_id)
                .bind(project_id)
                .bind(&canonical_origin)
                .bind(extract_repo_name(&canonical_origin))
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                repo_id
            }
        };

        let existing = sqlx::query(
            r#"
            SELECT workspace_id, alias FROM workspaces
            WHERE project_id = ?1 AND agent_id = ?2 AND repo_id = ?3 AND deleted_at IS NULL
            "#,
        )
        .bind(project_id)
        .bind(agent_id)
        .bind(&repo_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (workspace_id, alias, workspace_created) = match existing {
            Some(row) => (row.get("workspace_id"), row.get("alias"), false),
            None => {
                let workspace_id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO workspaces
                        (workspace_id, project_id, repo_id, agent_id, alias, role,
                         human_name, hostname, workspace_path, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                )
                .bind(&workspace_id)
                .bind(project_id)
                .bind(&repo_id)
                .bind(agent_id)
                .bind(agent_alias)
                .bind(&role)
                .bind(human_name)
                .bind(hostname)
                .bind(workspace_path)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                (workspace_id, agent_alias.to_string(), true)
            }
        };

        let policy_version = match policies::create_version_in(
            &mut tx,
            project_id,
            policies::default_bundle(),
            None,
            Some("system"),
        )
        .await
        {
            Ok(record) => record.version,
            Err(ApiError::PolicyConflict { current_version, .. }) => current_version,
            Err(err) => return Err(err),
        };

        tx.commit().await?;

        Ok(InitOutcome {
            status: "ok",
            api_key: String::new(),
            created: false,
            workspace_created,
            project_id: project_id.to_string(),
            project_slug,
            agent_id: agent_id.to_string(),
            repo_id,
            workspace_id,
            canonical_origin,
            alias,
            policy_version,
            created_at: now,
        })
    }

    /// Soft-delete a workspace: the row stays for history, its claims are
    /// released, and its presence record is dropped. Subsequent agent calls
    /// for this workspace get 410.
    pub async fn delete_workspace(
        &self,
        engine: &SyncEngine,
        presence: &PresenceCache,
        workspace: &BoundWorkspace,
    ) -> ApiResult<Vec<String>> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(
            "UPDATE workspaces SET deleted_at = ?2 WHERE workspace_id = ?1 AND deleted_at IS NULL",
        )
        .bind(&workspace.workspace_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        let released = engine
            .release_all_claims(&mut *tx, &workspace.workspace_id)
            .await?;
        tx.commit().await?;

        presence.clear(&workspace.workspace_id).await;
        tracing::info!(
            workspace_id = %workspace.workspace_id,
            released = released.len(),
            "workspace soft-deleted"
        );
        Ok(released)
    }
}

/// Pick a free alias: classic name + role suffix, with a numeric insert on
/// collision (alice-reviewer, bob-02-reviewer, ...).
async fn suggest_alias(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    role: &str,
) -> ApiResult<String> {
    let prefix = role_to_alias_prefix(role);

    for round in 0..100u32 {
        for name in CLASSIC_NAMES {
            let candidate = if round == 0 {
                format!("{name}-{prefix}")
            } else {
                format!("{name}-{:02}-{prefix}", round + 1)
            };
            let taken = sqlx::query(
                "SELECT 1 FROM workspaces WHERE project_id = ?1 AND alias = ?2 AND deleted_at IS NULL",
            )
            .bind(project_id)
            .bind(&candidate)
            .fetch_optional(&mut **tx)
            .await?;
            if taken.is_none() {
                return Ok(candidate);
            }
        }
    }
    Err(ApiError::validation("no free alias available"))
}
