use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::Row;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{ApiError, ApiResult};

/// A named invariant document agents are expected to uphold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invariant {
    pub id: String,
    pub title: String,
    pub body_md: String,
}

/// Role playbook text keyed by role id in the bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolePlaybook {
    pub title: String,
    pub playbook_md: String,
}

/// Engine-interpreted knobs. Everything not modeled here rides along in
/// `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicySettings {
    #[serde(default)]
    pub allow_coordinated_claims: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Versioned rule bundle: structured invariants plus role playbooks.
/// Unknown top-level keys are preserved round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyBundle {
    #[serde(default)]
    pub invariants: Vec<Invariant>,
    #[serde(default)]
    pub roles: BTreeMap<String, RolePlaybook>,
    #[serde(default)]
    pub adapters: Map<String, Value>,
    #[serde(default)]
    pub settings: PolicySettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyRecord {
    pub policy_id: String,
    pub project_id: String,
    pub version: i64,
    pub bundle: PolicyBundle,
    pub created_by: Option<String>,
    pub created_at: String,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Default bundle, embedded as markdown documents with frontmatter
// ---------------------------------------------------------------------------

const DEFAULT_INVARIANTS: &[&str] = &[
    include_str!("defaults/invariants/claims-before-work.md"),
    include_str!("defaults/invariants/communication-mail-first.md"),
    include_str!("defaults/invariants/tracking-single-source.md"),
];

const DEFAULT_ROLES: &[&str] = &[
    include_str!("defaults/roles/coordinator.md"),
    include_str!("defaults/roles/developer.md"),
    include_str!("defaults/roles/reviewer.md"),
];

/// Parse `---` fenced frontmatter with simple `key: value` lines. Not a YAML
/// parser; the embedded documents only carry `id` and `title`.
fn parse_frontmatter(content: &str) -> Result<(BTreeMap<String, String>, String), String> {
    let content = content.trim();
    let rest = content
        .strip_prefix("---")
        .ok_or("missing frontmatter opening ---")?;
    let end = rest.find("---").ok_or("missing frontmatter closing ---")?;

    let mut fields = BTreeMap::new();
    for line in rest[..end].lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !key.is_empty() && !value.is_empty() {
                fields.insert(key.to_string(), value.to_string());
            }
        }
    }
    let body = rest[end + 3..].trim().to_string();
    Ok((fields, body))
}

fn load_default_bundle() -> Result<PolicyBundle, String> {
    let mut bundle = PolicyBundle::default();

    for doc in DEFAULT_INVARIANTS {
        let (fields, body) = parse_frontmatter(doc)?;
        let id = fields.get("id").ok_or("invariant missing id")?.clone();
        let title = fields.get("title").ok_or("invariant missing title")?.clone();
        if bundle.invariants.iter().any(|inv| inv.id == id) {
            return Err(format!("duplicate invariant id '{id}'"));
        }
        bundle.invariants.push(Invariant {
            id,
            title,
            body_md: body,
        });
    }

    for doc in DEFAULT_ROLES {
        let (fields, body) = parse_frontmatter(doc)?;
        let id = fields.get("id").ok_or("role missing id")?.clone();
        let title = fields.get("title").ok_or("role missing title")?.clone();
        if bundle
            .roles
            .insert(
                id.clone(),
                RolePlaybook {
                    title,
                    playbook_md: body,
                },
            )
            .is_some()
        {
            return Err(format!("duplicate role id '{id}'"));
        }
    }

    Ok(bundle)
}

/// The baseline bundle activated as version 1 for projects with no policy.
pub fn default_bundle() -> &'static PolicyBundle {
    static BUNDLE: OnceLock<PolicyBundle> = OnceLock::new();
    BUNDLE.get_or_init(|| {
        load_default_bundle().expect("embedded default policy bundle is well-formed")
    })
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Create a new policy version and activate it.
///
/// Optimistic concurrency: `base_policy_id` must match the currently active
/// policy (or be None when the project has none), otherwise the call fails
/// with a conflict naming the current version. The version number comes from
/// the project's policy counter, bumped under the write transaction so
/// concurrent activations cannot collide.
pub async fn create_policy_version(
    db: &Database,
    project_id: &str,
    bundle: &PolicyBundle,
    base_policy_id: Option<&str>,
    created_by: Option<&str>,
) -> ApiResult<PolicyRecord> {
    let mut tx = db.pool().begin().await?;
    let record = create_version_in(&mut tx, project_id, bundle, base_policy_id, created_by).await?;
    tx.commit().await?;
    tracing::info!(project_id, version = record.version, "activated policy version");
    Ok(record)
}

/// Transaction-scoped variant so callers (bootstrap) can fold policy
/// activation into a larger atomic unit.
pub async fn create_version_in(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    bundle: &PolicyBundle,
    base_policy_id: Option<&str>,
    created_by: Option<&str>,
) -> ApiResult<PolicyRecord> {
    let project = sqlx::query("SELECT active_policy_id FROM projects WHERE id = ?1")
        .bind(project_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(ApiError::NotFound("project"))?;
    let active_policy_id: Option<String> = project.get("active_policy_id");

    if active_policy_id.as_deref() != base_policy_id {
        let (current_policy_id, current_version) = match &active_policy_id {
            Some(policy_id) => {
                let row = sqlx::query("SELECT version FROM project_policies WHERE policy_id = ?1")
                    .bind(policy_id)
                    .fetch_one(&mut **tx)
                    .await?;
                (policy_id.clone(), row.get::<i64, _>("version"))
            }
            None => (String::new(), 0),
        };
        return Err(ApiError::PolicyConflict {
            current_policy_id,
            current_version,
        });
    }

    // Counter bump takes the project's write lock for the rest of the
    // transaction, so version numbers are monotonic under concurrency.
    let row = sqlx::query(
        "UPDATE projects SET policy_seq = policy_seq + 1 WHERE id = ?1 RETURNING policy_seq",
    )
    .bind(project_id)
    .fetch_one(&mut **tx)
    .await?;
    let version: i64 = row.get("policy_seq");

    let policy_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    let bundle_json = serde_json::to_string(bundle)
        .map_err(|err| ApiError::validation(format!("unserializable bundle: {err}")))?;

    sqlx::query(
        r#"
        INSERT INTO project_policies (policy_id, project_id, version, bundle_json, created_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&policy_id)
    .bind(project_id)
    .bind(version)
    .bind(&bundle_json)
    .bind(created_by)
    .bind(&created_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query("UPDATE projects SET active_policy_id = ?1 WHERE id = ?2")
        .bind(&policy_id)
        .bind(project_id)
        .execute(&mut **tx)
        .await?;

    Ok(PolicyRecord {
        policy_id,
        project_id: project_id.to_string(),
        version,
        bundle: bundle.clone(),
        created_by: created_by.map(str::to_string),
        created_at,
        is_active: true,
    })
}

/// Fetch the active policy, bootstrapping the default bundle as version 1
/// when the project has none yet.
pub async fn get_active_policy(db: &Database, project_id: &str) -> ApiResult<PolicyRecord> {
    if let Some(record) = fetch_active(db, project_id).await? {
        return Ok(record);
    }
    match create_policy_version(db, project_id, default_bundle(), None, Some("system")).await {
        Ok(record) => Ok(record),
        // Lost the bootstrap race; the winner's version is now active.
        Err(ApiError::PolicyConflict { .. }) => fetch_active(db, project_id)
            .await?
            .ok_or(ApiError::NotFound("policy")),
        Err(err) => Err(err),
    }
}

async fn fetch_active(db: &Database, project_id: &str) -> ApiResult<Option<PolicyRecord>> {
    let row = sqlx::query(
        r#"
        SELECT p.policy_id, p.project_id, p.version, p.bundle_json, p.created_by, p.created_at
        FROM project_policies p
        JOIN projects pr ON pr.active_policy_id = p.policy_id
        WHERE pr.id = ?1
        "#,
    )
    .bind(project_id)
    .fetch_optional(db.pool())
    .await?;

    row.map(|row| record_from_row(&row, true)).transpose()
}

/// Fetch one retained version by id (history is independently fetchable).
pub async fn get_policy(
    db: &Database,
    project_id: &str,
    policy_id: &str,
) -> ApiResult<PolicyRecord> {
    let active = active_policy_id(db, project_id).await?;
    let row = sqlx::query(
        r#"
        SELECT policy_id, project_id, version, bundle_json, created_by, created_at
        FROM project_policies
        WHERE project_id = ?1 AND policy_id = ?2
        "#,
    )
    .bind(project_id)
    .bind(policy_id)
    .fetch_optional(db.pool())
    .await?
    .ok_or(ApiError::NotFound("policy"))?;

    record_from_row(&row, active.as_deref() == Some(policy_id))
}

/// List all versions, newest first.
pub async fn list_policy_versions(
    db: &Database,
    project_id: &str,
) -> ApiResult<Vec<PolicyRecord>> {
    let active = active_policy_id(db, project_id).await?;
    let rows = sqlx::query(
        r#"
        SELECT policy_id, project_id, version, bundle_json, created_by, created_at
        FROM project_policies
        WHERE project_id = ?1
        ORDER BY version DESC
        "#,
    )
    .bind(project_id)
    .fetch_all(db.pool())
    .await?;

    rows.iter()
        .map(|row| {
            let policy_id: String = row.get("policy_id");
            record_from_row(row, active.as_deref() == Some(policy_id.as_str()))
        })
        .collect()
}

async fn active_policy_id(db: &Database, project_id: &str) -> ApiResult<Option<String>> {
    let row = sqlx::query("SELECT active_policy_id FROM projects WHERE id = ?1")
        .bind(project_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or(ApiError::NotFound("project"))?;
    Ok(row.get("active_policy_id"))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow, is_active: bool) -> ApiResult<PolicyRecord> {
    let bundle_json: String = row.get("bundle_json");
    let bundle: PolicyBundle = serde_json::from_str(&bundle_json)
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("corrupt policy bundle: {err}")))?;
    Ok(PolicyRecord {
        policy_id: row.get("policy_id"),
        project_id: row.get("project_id"),
        version: row.get("version"),
        bundle,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        is_active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bundle_loads() {
        let bundle = default_bundle();
        assert_eq!(bundle.invariants.len(), 3);
        assert_eq!(bundle.roles.len(), 3);
        assert!(bundle.roles.contains_key("developer"));
        assert!(!bundle.settings.allow_coordinated_claims);
    }

    #[test]
    fn frontmatter_parses_fields_and_body() {
        let (fields, body) =
            parse_frontmatter("---\nid: a.b\ntitle: \"Some title\"\n---\n\nBody text.").unwrap();
        assert_eq!(fields["id"], "a.b");
        assert_eq!(fields["title"], "Some title");
        assert_eq!(body, "Body text.");
    }

    #[test]
    fn frontmatter_requires_fences() {
        assert!(parse_frontmatter("no fences at all").is_err());
        assert!(parse_frontmatter("---\nid: x").is_err());
    }

    #[test]
    fn unknown_bundle_keys_survive_roundtrip() {
        let raw = serde_json::json!({
            "invariants": [],
            "roles": {},
            "custom_section": {"anything": true},
            "settings": {"allow_coordinated_claims": true, "max_agents": 7},
        });
        let bundle: PolicyBundle = serde_json::from_value(raw).unwrap();
        assert!(bundle.settings.allow_coordinated_claims);
        assert_eq!(bundle.settings.extra["max_agents"], 7);
        let back = serde_json::to_value(&bundle).unwrap();
        assert_eq!(back["custom_section"]["anything"], true);
    }
}
