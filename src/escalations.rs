use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::auth::BoundWorkspace;
use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::events::{Event, EventBus, EventKind};
use crate::outbox;

const MAX_SUBJECT_LEN: usize = 200;
const MAX_OPTIONS: usize = 10;
const MAX_OPTION_LEN: usize = 100;
const MIN_TIMEOUT_SECONDS: i64 = 60;
const MAX_TIMEOUT_SECONDS: i64 = 86_400;

/// A human-intervention request. Transitions once: pending -> responded or
/// pending -> expired; terminal states are immutable.
#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub alias: String,
    pub subject: String,
    pub body: String,
    pub options: Vec<String>,
    pub status: String,
    pub response: Option<String>,
    pub responded_by: Option<String>,
    pub responded_at: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

fn validate(subject: &str, options: &[String], timeout_seconds: Option<i64>) -> ApiResult<()> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(ApiError::validation("subject must not be empty"));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(ApiError::validation(format!(
            "subject must be at most {MAX_SUBJECT_LEN} characters"
        )));
    }
    if options.len() > MAX_OPTIONS {
        return Err(ApiError::validation(format!(
            "at most {MAX_OPTIONS} options allowed"
        )));
    }
    for option in options {
        if option.trim().is_empty() || option.len() > MAX_OPTION_LEN {
            return Err(ApiError::validation(format!(
                "options must be non-empty and at most {MAX_OPTION_LEN} characters"
            )));
        }
    }
    if let Some(timeout) = timeout_seconds {
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&timeout) {
            return Err(ApiError::validation(format!(
                "timeout_seconds must be between {MIN_TIMEOUT_SECONDS} and {MAX_TIMEOUT_SECONDS}"
            )));
        }
    }
    Ok(())
}

pub async fn create(
    db: &Database,
    bus: &EventBus,
    workspace: &BoundWorkspace,
    subject: &str,
    body: &str,
    options: Vec<String>,
    timeout_seconds: Option<i64>,
) -> ApiResult<Escalation> {
    validate(subject, &options, timeout_seconds)?;

    let now = Utc::now();
    let expires_at = timeout_seconds.map(|timeout| (now + Duration::seconds(timeout)).to_rfc3339());
    let escalation = Escalation {
        id: Uuid::new_v4().to_string(),
        project_id: workspace.project_id.clone(),
        workspace_id: workspace.workspace_id.clone(),
        alias: workspace.alias.clone(),
        subject: subject.trim().to_string(),
        body: body.to_string(),
        options,
        status: "pending".to_string(),
        response: None,
        responded_by: None,
        responded_at: None,
        expires_at,
        created_at: now.to_rfc3339(),
    };

    sqlx::query(
        r#"
        INSERT INTO escalations
            (id, project_id, workspace_id, alias, subject, body, options_json,
             status, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9)
        "#,
    )
    .bind(&escalation.id)
    .bind(&escalation.project_id)
    .bind(&escalation.workspace_id)
    .bind(&escalation.alias)
    .bind(&escalation.subject)
    .bind(&escalation.body)
    .bind(serde_json::to_string(&escalation.options).unwrap_or_else(|_| "[]".into()))
    .bind(&escalation.expires_at)
    .bind(&escalation.created_at)
    .execute(db.pool())
    .await?;

    bus.publish(Event::now(
        &escalation.project_id,
        &escalation.workspace_id,
        EventKind::EscalationCreated {
            escalation_id: escalation.id.clone(),
            alias: escalation.alias.clone(),
            subject: escalation.subject.clone(),
        },
    ));

    tracing::info!(escalation_id = %escalation.id, alias = %escalation.alias, "escalation created");
    Ok(escalation)
}

pub async fn get(db: &Database, project_id: &str, escalation_id: &str) -> ApiResult<Escalation> {
    let row = sqlx::query("SELECT * FROM escalations WHERE project_id = ?1 AND id = ?2")
        .bind(project_id)
        .bind(escalation_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or(ApiError::NotFound("escalation"))?;
    Ok(from_row(&row))
}

pub async fn list(
    db: &Database,
    project_id: &str,
    status: Option<&str>,
) -> ApiResult<Vec<Escalation>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(
                "SELECT * FROM escalations WHERE project_id = ?1 AND status = ?2 ORDER BY created_at DESC",
            )
            .bind(project_id)
            .bind(status)
            .fetch_all(db.pool())
            .await?
        }
        None => {
            sqlx::query("SELECT * FROM escalations WHERE project_id = ?1 ORDER BY created_at DESC")
                .bind(project_id)
                .fetch_all(db.pool())
                .await?
        }
    };
    Ok(rows.iter().map(from_row).collect())
}

/// Record a human response. The status check and the update run in one
/// transaction, so exactly one responder wins; later attempts get a conflict
/// naming the terminal state. The raising workspace is notified through the
/// outbox in the same commit.
pub async fn respond(
    db: &Database,
    bus: &EventBus,
    project_id: &str,
    escalation_id: &str,
    response: &str,
    responded_by: &str,
) -> ApiResult<Escalation> {
    let response = response.trim();
    if response.is_empty() {
        return Err(ApiError::validation("response must not be empty"));
    }

    let mut tx = db.pool().begin().await?;

    let row = sqlx::query("SELECT * FROM escalations WHERE project_id = ?1 AND id = ?2")
        .bind(project_id)
        .bind(escalation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ApiError::NotFound("escalation"))?;
    let mut escalation = from_row(&row);

    if escalation.status != "pending" {
        return Err(ApiError::EscalationClosed {
            status: escalation.status,
        });
    }

    let responded_at = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE escalations
        SET status = 'responded', response = ?3, responded_by = ?4, responded_at = ?5
        WHERE project_id = ?1 AND id = ?2 AND status = 'pending'
        "#,
    )
    .bind(project_id)
    .bind(escalation_id)
    .bind(response)
    .bind(responded_by)
    .bind(&responded_at)
    .execute(&mut *tx)
    .await?;

    outbox::record_escalation_response(
        &mut tx,
        project_id,
        &escalation.workspace_id,
        &escalation.alias,
        escalation_id,
        &escalation.subject,
        response,
    )
    .await?;

    tx.commit().await?;

    escalation.status = "responded".to_string();
    escalation.response = Some(response.to_string());
    escalation.responded_by = Some(responded_by.to_string());
    escalation.responded_at = Some(responded_at);

    bus.publish(Event::now(
        project_id,
        &escalation.workspace_id,
        EventKind::EscalationResponded {
            escalation_id: escalation_id.to_string(),
            response: response.to_string(),
        },
    ));

    Ok(escalation)
}

/// Flip pending escalations past their deadline to expired. Driven by the
/// background sweeper; derives everything from the table, so a restart never
/// loses a deadline.
pub async fn expire_pending(db: &Database, bus: &EventBus) -> ApiResult<usize> {
    let now = Utc::now().to_rfc3339();
    let rows = sqlx::query(
        r#"
        UPDATE escalations
        SET status = 'expired'
        WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1
        RETURNING id, project_id, workspace_id
        "#,
    )
    .bind(&now)
    .fetch_all(db.pool())
    .await?;

    for row in &rows {
        let escalation_id: String = row.get("id");
        tracing::info!(escalation_id, "escalation expired without response");
        bus.publish(Event::now(
            &row.get::<String, _>("project_id"),
            &row.get::<String, _>("workspace_id"),
            EventKind::Opaque {
                event_type: "escalation.expired".to_string(),
                payload: serde_json::json!({ "escalation_id": escalation_id }),
            },
        ));
    }

    Ok(rows.len())
}

pub async fn pending_count(db: &Database, project_id: &str) -> ApiResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS pending FROM escalations WHERE project_id = ?1 AND status = 'pending'",
    )
    .bind(project_id)
    .fetch_one(db.pool())
    .await?;
    Ok(row.get("pending"))
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Escalation {
    let options_json: String = row.get("options_json");
    Escalation {
        id: row.get("id"),
        project_id: row.get("project_id"),
        workspace_id: row.get("workspace_id"),
        alias: row.get("alias"),
        subject: row.get("subject"),
        body: row.get("body"),
        options: serde_json::from_str(&options_json).unwrap_or_default(),
        status: row.get("status"),
        response: row.get("response"),
        responded_by: row.get("responded_by"),
        responded_at: row.get("responded_at"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
    }
}
