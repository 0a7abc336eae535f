use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqliteConnection};

use crate::auth::BoundWorkspace;
use crate::db::Database;
use crate::error::ApiResult;
use crate::events::{Event, EventBus, EventKind};
use crate::outbox;

pub const DEFAULT_BRANCH: &str = "main";

// Identifier shapes accepted from clients. Each pattern anchors on an
// alphanumeric first character so separator-only and traversal-style values
// never get through.
static BEAD_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,99}$").unwrap());
static BRANCH_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9/_.-]{0,254}$").unwrap());
static CANONICAL_ORIGIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]*(/[a-zA-Z0-9][a-zA-Z0-9._-]*)*$").unwrap()
});
static ALIAS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").unwrap());
static HUMAN_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9 '\-]{0,63}$").unwrap());

pub fn is_valid_bead_id(bead_id: &str) -> bool {
    BEAD_ID_PATTERN.is_match(bead_id)
}

pub fn is_valid_branch_name(branch: &str) -> bool {
    BRANCH_NAME_PATTERN.is_match(branch)
}

pub fn is_valid_canonical_origin(origin: &str) -> bool {
    origin.len() <= 255 && CANONICAL_ORIGIN_PATTERN.is_match(origin)
}

pub fn is_valid_alias(alias: &str) -> bool {
    ALIAS_PATTERN.is_match(alias)
}

pub fn is_valid_human_name(name: &str) -> bool {
    HUMAN_NAME_PATTERN.is_match(name)
}

/// One work item as pushed by the client. The server mirrors content
/// verbatim; it is only authoritative over claims and sync bookkeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<Value>,
    #[serde(default)]
    pub issue_type: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub labels: Option<Value>,
    #[serde(default)]
    pub blocked_by: Vec<Value>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Opt-in marker for shared (multi-workspace) claims.
    #[serde(default)]
    pub coordinated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    #[serde(rename = "type")]
    pub dep_type: Option<String>,
    pub depends_on_id: Option<String>,
}

/// A fully-qualified reference to a bead in some repo/branch scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadRef {
    pub repo: String,
    pub branch: String,
    pub bead_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// A status transition observed during a sync, recorded for notification
/// fan-out and event publishing.
#[derive(Debug, Clone, Serialize)]
pub struct BeadStatusChange {
    pub bead_id: String,
    pub repo: String,
    pub branch: String,
    pub old_status: Option<String>,
    pub new_status: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimRejection {
    pub bead_id: String,
    pub held_by: String,
    pub holder_alias: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SyncOutcome {
    pub issues_synced: usize,
    pub issues_added: usize,
    pub issues_updated: usize,
    pub deleted: usize,
    pub synced_at: String,
    pub repo: String,
    pub branch: String,
    /// Bead ids skipped because the incoming update was older than the
    /// stored row.
    pub conflicts: Vec<String>,
    pub status_changes: Vec<BeadStatusChange>,
    pub claims_granted: Vec<String>,
    pub claims_rejected: Vec<ClaimRejection>,
    pub outbox_entries: usize,
}

/// An active claim as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimView {
    pub bead_id: String,
    pub repo: String,
    pub branch: String,
    pub workspace_id: String,
    pub coordinated: bool,
    pub claimed_at: String,
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse a JSONL payload into work items. Malformed lines and invalid bead
/// ids are skipped with a warning; later duplicates of an id win.
pub fn parse_items_jsonl(payload: &str) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();

    for (line_no, line) in payload.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item: WorkItem = match serde_json::from_str(line) {
            Ok(item) => item,
            Err(err) => {
                tracing::warn!(line = line_no + 1, %err, "skipping malformed work item line");
                continue;
            }
        };
        if !is_valid_bead_id(&item.id) {
            tracing::warn!(
                line = line_no + 1,
                bead_id = %item.id.chars().take(50).collect::<String>(),
                "skipping work item with invalid bead id"
            );
            continue;
        }
        match index_by_id.get(&item.id) {
            Some(&idx) => items[idx] = item,
            None => {
                index_by_id.insert(item.id.clone(), items.len());
                items.push(item);
            }
        }
    }
    items
}

/// Parse a dependency reference string into a [`BeadRef`]. A colon marks a
/// cross-repo reference (`repo:bead_id`); those get the default branch since
/// the format carries none.
fn parse_dependency_ref(depends_on: &str, default_repo: &str, default_branch: &str) -> Option<BeadRef> {
    let depends_on = depends_on.trim();
    if depends_on.is_empty() {
        return None;
    }

    if let Some((ref_repo, ref_bead_id)) = depends_on.split_once(':') {
        let ref_repo = ref_repo.trim();
        let ref_bead_id = ref_bead_id.trim();
        if ref_repo.is_empty() || !is_valid_bead_id(ref_bead_id) {
            tracing::warn!(reference = depends_on, "malformed cross-repo dependency ref");
            return None;
        }
        if !is_valid_canonical_origin(ref_repo) {
            tracing::warn!(repo = ref_repo, "invalid repo in cross-repo dependency ref");
            return None;
        }
        Some(BeadRef {
            repo: ref_repo.to_string(),
            branch: default_branch.to_string(),
            bead_id: ref_bead_id.to_string(),
        })
    } else {
        if !is_valid_bead_id(depends_on) {
            tracing::warn!(reference = depends_on, "invalid bead id in dependency ref");
            return None;
        }
        Some(BeadRef {
            repo: default_repo.to_string(),
            branch: default_branch.to_string(),
            bead_id: depends_on.to_string(),
        })
    }
}

fn parse_structured_ref(item: &Value, default_repo: &str, default_branch: &str) -> Option<BeadRef> {
    let bead_id = item.get("bead_id").and_then(Value::as_str)?;
    if !is_valid_bead_id(bead_id) {
        tracing::warn!(bead_id, "invalid bead_id in structured blocked_by");
        return None;
    }
    let repo = item.get("repo").and_then(Value::as_str);
    if let Some(repo) = repo {
        if !is_valid_canonical_origin(repo) {
            tracing::warn!(repo, "invalid repo in structured blocked_by");
            return None;
        }
    }
    let branch = item.get("branch").and_then(Value::as_str);
    if let Some(branch) = branch {
        if !is_valid_branch_name(branch) {
            tracing::warn!(branch, "invalid branch in structured blocked_by");
            return None;
        }
    }
    Some(BeadRef {
        repo: repo.unwrap_or(default_repo).to_string(),
        branch: branch.unwrap_or(default_branch).to_string(),
        bead_id: bead_id.to_string(),
    })
}

/// Parse a blocked_by array accepting both simple strings and structured
/// `{repo, branch, bead_id}` entries. Invalid entries are skipped.
pub fn parse_blocked_by(
    blocked_by: &[Value],
    default_repo: &str,
    default_branch: &str,
) -> Vec<BeadRef> {
    let mut refs = Vec::new();
    for entry in blocked_by {
        let parsed = match entry {
            Value::String(s) => parse_dependency_ref(s, default_repo, default_branch),
            Value::Object(_) => parse_structured_ref(entry, default_repo, default_branch),
            other => {
                tracing::warn!(entry = %other, "unexpected type in blocked_by array");
                None
            }
        };
        if let Some(reference) = parsed {
            refs.push(reference);
        }
    }
    refs
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Naive timestamps (no offset) are taken as UTC
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn priority_text(priority: &Option<Value>) -> Option<String> {
    match priority {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn normalized_created_by(created_by: &Option<String>) -> Option<String> {
    let trimmed = created_by.as_deref()?.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() > 255 {
        tracing::warn!(len = trimmed.len(), "truncating created_by");
        return Some(trimmed.chars().take(255).collect());
    }
    Some(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Sync engine
// ---------------------------------------------------------------------------

/// Executes client-pushed sync payloads: mirror upserts, claim arbitration,
/// status-change detection, and outbox fan-out — all in one transaction.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    bus: EventBus,
}

impl SyncEngine {
    pub fn new(db: Database, bus: EventBus) -> Self {
        Self { db, bus }
    }

    /// Apply a batch of changed items plus explicit deletions for one
    /// repo/branch scope. Everything commits together or not at all.
    ///
    /// `allow_coordinated_claims` comes from the active policy bundle; it is
    /// resolved by the caller before the transaction opens.
    pub async fn sync(
        &self,
        workspace: &BoundWorkspace,
        repo: &str,
        branch: &str,
        items: Vec<WorkItem>,
        deleted_ids: &[String],
        allow_coordinated_claims: bool,
    ) -> ApiResult<SyncOutcome> {
        let now = Utc::now();
        let mut outcome = SyncOutcome {
            issues_synced: items.len(),
            synced_at: now.to_rfc3339(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            ..Default::default()
        };

        // Target status of every item in this payload, for dependency
        // filtering (blocks-type deps on closed targets don't block).
        let payload_status: HashMap<String, Option<String>> = items
            .iter()
            .map(|item| (item.id.clone(), item.status.clone()))
            .collect();

        let mut tx = self.db.pool().begin().await?;
        let mut events = Vec::new();

        for item in &items {
            self.apply_item(
                &mut tx,
                workspace,
                repo,
                branch,
                item,
                &payload_status,
                now,
                allow_coordinated_claims,
                &mut outcome,
                &mut events,
            )
            .await?;
        }

        outcome.deleted = self
            .delete_items(&mut tx, workspace, repo, branch, deleted_ids, &mut events)
            .await?;

        // Outbox rows commit together with the status changes that caused them
        outcome.outbox_entries = outbox::record_status_changes(
            &mut tx,
            &workspace.project_id,
            &outcome.status_changes,
        )
        .await?;

        tx.commit().await?;

        for event in events {
            self.bus.publish(event);
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_item(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        workspace: &BoundWorkspace,
        repo: &str,
        branch: &str,
        item: &WorkItem,
        payload_status: &HashMap<String, Option<String>>,
        now: DateTime<Utc>,
        allow_coordinated_claims: bool,
        outcome: &mut SyncOutcome,
        events: &mut Vec<Event>,
    ) -> ApiResult<()> {
        let project_id = &workspace.project_id;

        let existing = sqlx::query(
            r#"
            SELECT status, updated_at FROM beads
            WHERE project_id = ?1 AND repo = ?2 AND branch = ?3 AND bead_id = ?4
            "#,
        )
        .bind(project_id)
        .bind(repo)
        .bind(branch)
        .bind(&item.id)
        .fetch_optional(&mut **tx)
        .await?;

        let incoming_updated_at = parse_timestamp(item.updated_at.as_deref());

        let old_status: Option<String> = match &existing {
            None => None,
            Some(row) => {
                // Optimistic freshness check: an incoming row older than the
                // stored one is stale and must not clobber it.
                let stored_updated_at =
                    parse_timestamp(row.get::<Option<String>, _>("updated_at").as_deref());
                if let (Some(incoming), Some(stored)) = (incoming_updated_at, stored_updated_at) {
                    if incoming < stored {
                        tracing::info!(
                            bead_id = %item.id,
                            "stale update skipped (incoming older than stored)"
                        );
                        outcome.conflicts.push(item.id.clone());
                        return Ok(());
                    }
                }
                row.get("status")
            }
        };

        // Claim arbitration happens inside this transaction so two racing
        // claim attempts serialize: one commits, the other observes it.
        if item.status.as_deref() == Some("in_progress") {
            let holder = sqlx::query(
                r#"
                SELECT c.workspace_id, w.alias
                FROM bead_claims c
                JOIN workspaces w ON w.workspace_id = c.workspace_id
                WHERE c.project_id = ?1 AND c.repo = ?2 AND c.branch = ?3 AND c.bead_id = ?4
                  AND c.workspace_id <> ?5
                  AND w.deleted_at IS NULL
                LIMIT 1
                "#,
            )
            .bind(project_id)
            .bind(repo)
            .bind(branch)
            .bind(&item.id)
            .bind(&workspace.workspace_id)
            .fetch_optional(&mut **tx)
            .await?;

            if let Some(holder) = holder {
                let coordinated = item.coordinated && allow_coordinated_claims;
                if !coordinated {
                    outcome.claims_rejected.push(ClaimRejection {
                        bead_id: item.id.clone(),
                        held_by: holder.get("workspace_id"),
                        holder_alias: holder.get("alias"),
                    });
                    return Ok(());
                }
            }

            sqlx::query(
                r#"
                INSERT INTO bead_claims
                    (project_id, repo, branch, bead_id, workspace_id, apex_bead_id, coordinated, claimed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)
                ON CONFLICT (project_id, repo, branch, bead_id, workspace_id)
                DO UPDATE SET coordinated = excluded.coordinated
                "#,
            )
            .bind(project_id)
            .bind(repo)
            .bind(branch)
            .bind(&item.id)
            .bind(&workspace.workspace_id)
            .bind(item.coordinated)
            .bind(now.to_rfc3339())
            .execute(&mut **tx)
            .await?;

            if old_status.as_deref() != Some("in_progress") {
                outcome.claims_granted.push(item.id.clone());
                events.push(Event::now(
                    project_id,
                    &workspace.workspace_id,
                    EventKind::ClaimAcquired {
                        bead_id: item.id.clone(),
                        alias: workspace.alias.clone(),
                        coordinated: item.coordinated,
                    },
                ));
            }
        } else {
            // Any non-in_progress status from this workspace releases its
            // claim; coordinated co-holders keep theirs.
            let released = sqlx::query(
                r#"
                DELETE FROM bead_claims
                WHERE project_id = ?1 AND repo = ?2 AND branch = ?3 AND bead_id = ?4
                  AND workspace_id = ?5
                "#,
            )
            .bind(project_id)
            .bind(repo)
            .bind(branch)
            .bind(&item.id)
            .bind(&workspace.workspace_id)
            .execute(&mut **tx)
            .await?;
            if released.rows_affected() > 0 {
                events.push(Event::now(
                    project_id,
                    &workspace.workspace_id,
                    EventKind::ClaimReleased {
                        bead_id: item.id.clone(),
                        alias: workspace.alias.clone(),
                    },
                ));
            }
        }

        // Status-change detection compares against the stored value so a
        // replayed payload produces no side effects.
        if let Some(new_status) = &item.status {
            if old_status.as_deref() != Some(new_status.as_str()) {
                let change = BeadStatusChange {
                    bead_id: item.id.clone(),
                    repo: repo.to_string(),
                    branch: branch.to_string(),
                    old_status: old_status.clone(),
                    new_status: new_status.clone(),
                    title: item.title.clone(),
                };
                events.push(Event::now(
                    project_id,
                    &workspace.workspace_id,
                    EventKind::BeadStatusChanged {
                        bead_id: change.bead_id.clone(),
                        repo: change.repo.clone(),
                        branch: change.branch.clone(),
                        old_status: change.old_status.clone(),
                        new_status: change.new_status.clone(),
                        title: change.title.clone(),
                    },
                ));
                outcome.status_changes.push(change);
            }
        }

        if existing.is_none() {
            outcome.issues_added += 1;
        } else {
            outcome.issues_updated += 1;
        }

        // Dependency handling: explicit blocked_by entries plus blocks-type
        // dependencies whose target isn't closed in this payload.
        let mut blocked_by = parse_blocked_by(&item.blocked_by, repo, branch);
        let mut parent_ref: Option<BeadRef> = None;
        for dep in &item.dependencies {
            let Some(depends_on) = dep.depends_on_id.as_deref() else {
                continue;
            };
            let Some(reference) = parse_dependency_ref(depends_on, repo, branch) else {
                continue;
            };
            match dep.dep_type.as_deref() {
                Some("parent-child") => {
                    if parent_ref.is_none() {
                        parent_ref = Some(reference);
                    }
                }
                Some("blocks") => {
                    let target_closed = payload_status
                        .get(depends_on)
                        .map(|status| status.as_deref() == Some("closed"))
                        .unwrap_or(false);
                    if !target_closed {
                        blocked_by.push(reference);
                    }
                }
                _ => {}
            }
        }

        let blocked_by_json = serde_json::to_string(&blocked_by).unwrap_or_else(|_| "[]".into());
        let parent_ref_json = parent_ref
            .as_ref()
            .and_then(|reference| serde_json::to_string(reference).ok());
        let labels_json = item.labels.as_ref().map(std::string::ToString::to_string);

        sqlx::query(
            r#"
            INSERT INTO beads (
                project_id, repo, branch, bead_id,
                title, description, status, priority, issue_type, assignee,
                created_by, labels, blocked_by, parent_ref,
                created_at, updated_at, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT (project_id, repo, branch, bead_id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                status = excluded.status,
                priority = excluded.priority,
                issue_type = excluded.issue_type,
                assignee = excluded.assignee,
                created_by = COALESCE(excluded.created_by, beads.created_by),
                labels = excluded.labels,
                blocked_by = excluded.blocked_by,
                parent_ref = excluded.parent_ref,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&workspace.project_id)
        .bind(repo)
        .bind(branch)
        .bind(&item.id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(&item.status)
        .bind(priority_text(&item.priority))
        .bind(&item.issue_type)
        .bind(&item.assignee)
        .bind(normalized_created_by(&item.created_by))
        .bind(labels_json)
        .bind(blocked_by_json)
        .bind(parent_ref_json)
        .bind(parse_timestamp(item.created_at.as_deref()).map(|ts| ts.to_rfc3339()))
        .bind(incoming_updated_at.map(|ts| ts.to_rfc3339()))
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn delete_items(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        workspace: &BoundWorkspace,
        repo: &str,
        branch: &str,
        deleted_ids: &[String],
        events: &mut Vec<Event>,
    ) -> ApiResult<usize> {
        let valid_ids: Vec<&String> = deleted_ids
            .iter()
            .filter(|bead_id| is_valid_bead_id(bead_id))
            .collect();
        if valid_ids.len() != deleted_ids.len() {
            tracing::warn!(
                skipped = deleted_ids.len() - valid_ids.len(),
                "skipping invalid bead ids in delete request"
            );
        }

        let mut deleted = 0;
        for bead_id in valid_ids {
            let result = sqlx::query(
                r#"
                DELETE FROM beads
                WHERE project_id = ?1 AND repo = ?2 AND branch = ?3 AND bead_id = ?4
                "#,
            )
            .bind(&workspace.project_id)
            .bind(repo)
            .bind(branch)
            .bind(bead_id)
            .execute(&mut **tx)
            .await?;
            deleted += result.rows_affected() as usize;

            let released = sqlx::query(
                r#"
                DELETE FROM bead_claims
                WHERE project_id = ?1 AND repo = ?2 AND branch = ?3 AND bead_id = ?4
                "#,
            )
            .bind(&workspace.project_id)
            .bind(repo)
            .bind(branch)
            .bind(bead_id)
            .execute(&mut **tx)
            .await?;
            if released.rows_affected() > 0 {
                events.push(Event::now(
                    &workspace.project_id,
                    &workspace.workspace_id,
                    EventKind::ClaimReleased {
                        bead_id: bead_id.clone(),
                        alias: workspace.alias.clone(),
                    },
                ));
            }
        }
        Ok(deleted)
    }

    /// Active claims held by a workspace.
    pub async fn claims_for_workspace(&self, workspace_id: &str) -> ApiResult<Vec<ClaimView>> {
        let rows = sqlx::query(
            r#"
            SELECT bead_id, repo, branch, workspace_id, coordinated, claimed_at
            FROM bead_claims
            WHERE workspace_id = ?1
            ORDER BY claimed_at
            "#,
        )
        .bind(workspace_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(claim_view_from_row).collect())
    }

    /// All in-progress beads in a project with their claim holders.
    pub async fn in_progress_beads(&self, project_id: &str) -> ApiResult<Vec<Value>> {
        let rows = sqlx::query(
            r#"
            SELECT b.bead_id, b.repo, b.branch, b.title, c.workspace_id, w.alias
            FROM beads b
            LEFT JOIN bead_claims c
                ON c.project_id = b.project_id AND c.repo = b.repo
               AND c.branch = b.branch AND c.bead_id = b.bead_id
            LEFT JOIN workspaces w ON w.workspace_id = c.workspace_id
            WHERE b.project_id = ?1 AND b.status = 'in_progress'
            ORDER BY b.bead_id
            "#,
        )
        .bind(project_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "bead_id": row.get::<String, _>("bead_id"),
                    "repo": row.get::<String, _>("repo"),
                    "branch": row.get::<String, _>("branch"),
                    "title": row.get::<Option<String>, _>("title"),
                    "holder_workspace_id": row.get::<Option<String>, _>("workspace_id"),
                    "holder_alias": row.get::<Option<String>, _>("alias"),
                })
            })
            .collect())
    }

    /// Release every claim a workspace holds (workspace deletion). Returns
    /// released bead ids.
    pub async fn release_all_claims(
        &self,
        conn: &mut SqliteConnection,
        workspace_id: &str,
    ) -> ApiResult<Vec<String>> {
        let rows = sqlx::query("DELETE FROM bead_claims WHERE workspace_id = ?1 RETURNING bead_id")
            .bind(workspace_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.iter().map(|row| row.get("bead_id")).collect())
    }
}

fn claim_view_from_row(row: &sqlx::sqlite::SqliteRow) -> ClaimView {
    ClaimView {
        bead_id: row.get("bead_id"),
        repo: row.get("repo"),
        branch: row.get("branch"),
        workspace_id: row.get("workspace_id"),
        coordinated: row.get("coordinated"),
        claimed_at: row.get("claimed_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bead_id_validation() {
        assert!(is_valid_bead_id("bd-abc123"));
        assert!(is_valid_bead_id("pgdbm-4uv.16"));
        assert!(!is_valid_bead_id(""));
        assert!(!is_valid_bead_id("-leading-dash"));
        assert!(!is_valid_bead_id(&"x".repeat(101)));
    }

    #[test]
    fn branch_and_origin_validation() {
        assert!(is_valid_branch_name("feature/new-ui"));
        assert!(is_valid_branch_name("release/v1.0.0"));
        assert!(!is_valid_branch_name("/leading-slash"));
        assert!(is_valid_canonical_origin("github.com/org/repo"));
        assert!(is_valid_canonical_origin("gitlab.example.com/team/project"));
        assert!(!is_valid_canonical_origin("github.com//repo"));
        assert!(!is_valid_canonical_origin("github.com/../etc"));
    }

    #[test]
    fn alias_and_human_name_validation() {
        assert!(is_valid_alias("frontend-bot"));
        assert!(is_valid_alias("backend_agent"));
        assert!(!is_valid_alias("-bad"));
        assert!(is_valid_human_name("Mary Jane"));
        assert!(is_valid_human_name("O'Brien"));
        assert!(!is_valid_human_name("4dmin"));
    }

    #[test]
    fn jsonl_skips_bad_lines_and_dedupes() {
        let payload = concat!(
            "{\"id\": \"bd-1\", \"status\": \"open\"}\n",
            "not json at all\n",
            "{\"status\": \"open\"}\n",
            "{\"id\": \"--bad--\", \"status\": \"open\"}\n",
            "\n",
            "{\"id\": \"bd-1\", \"status\": \"closed\"}\n",
        );
        let items = parse_items_jsonl(payload);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status.as_deref(), Some("closed"));
    }

    #[test]
    fn blocked_by_accepts_both_shapes() {
        let refs = parse_blocked_by(
            &[
                json!("bd-001"),
                json!("other-repo:bd-002"),
                json!({"bead_id": "bd-003", "branch": "dev"}),
                json!({"repo": "bad repo!", "bead_id": "bd-004"}),
                json!(42),
            ],
            "github.com/o/r",
            "main",
        );
        assert_eq!(
            refs,
            vec![
                BeadRef {
                    repo: "github.com/o/r".into(),
                    branch: "main".into(),
                    bead_id: "bd-001".into()
                },
                BeadRef {
                    repo: "other-repo".into(),
                    branch: "main".into(),
                    bead_id: "bd-002".into()
                },
                BeadRef {
                    repo: "github.com/o/r".into(),
                    branch: "dev".into(),
                    bead_id: "bd-003".into()
                },
            ]
        );
    }

    #[test]
    fn timestamps_parse_with_and_without_offset() {
        assert!(parse_timestamp(Some("2026-01-05T10:00:00Z")).is_some());
        assert!(parse_timestamp(Some("2026-01-05T10:00:00+02:00")).is_some());
        assert!(parse_timestamp(Some("2026-01-05T10:00:00.123456")).is_some());
        assert!(parse_timestamp(Some("next tuesday")).is_none());
        assert!(parse_timestamp(None).is_none());
    }

    #[test]
    fn priority_keeps_strings_and_stringifies_numbers() {
        assert_eq!(priority_text(&Some(json!("high"))), Some("high".into()));
        assert_eq!(priority_text(&Some(json!(2))), Some("2".into()));
        assert_eq!(priority_text(&None), None);
    }

    #[test]
    fn created_by_is_trimmed_and_bounded() {
        assert_eq!(normalized_created_by(&Some("  al  ".into())), Some("al".into()));
        assert_eq!(normalized_created_by(&Some("   ".into())), None);
        let long = "x".repeat(300);
        assert_eq!(normalized_created_by(&Some(long)).unwrap().len(), 255);
    }
}
