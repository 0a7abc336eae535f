use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::beads::BeadStatusChange;
use crate::config::OutboxConfig;
use crate::db::Database;
use crate::error::ApiResult;
use crate::events::{Event, EventBus, EventKind};
use crate::identity::{IdentityAccess, OutgoingMessage};

/// Sender identity stamped on notification mail.
const SENDER_AGENT_ID: &str = "system";
const SENDER_ALIAS: &str = "beadhive";

/// Record notification intents for a batch of status changes, inside the
/// caller's transaction. One outbox row per (change, subscriber) pair.
///
/// Brand-new beads (no prior status) don't notify; watchers care about
/// transitions, not mirror backfill.
pub async fn record_status_changes(
    tx: &mut Transaction<'_, Sqlite>,
    project_id: &str,
    changes: &[BeadStatusChange],
) -> ApiResult<usize> {
    let mut entries_created = 0;

    for change in changes {
        if change.old_status.is_none() {
            continue;
        }

        // Registrations can be exact ids or prefix patterns, so the narrowing
        // to this bead happens in code after the project-level fetch.
        let subscribers: Vec<_> = sqlx::query(
            r#"
            SELECT s.bead_id AS registration, s.workspace_id, w.alias
            FROM subscriptions s
            JOIN workspaces w ON w.workspace_id = s.workspace_id
            WHERE s.project_id = ?1
              AND s.event_type = 'status_change'
              AND (s.repo IS NULL OR s.repo = ?2)
              AND w.deleted_at IS NULL
            "#,
        )
        .bind(project_id)
        .bind(&change.repo)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .filter(|row| {
            crate::subscriptions::matches_bead(
                &row.get::<String, _>("registration"),
                &change.bead_id,
            )
        })
        .collect();

        if subscribers.is_empty() {
            continue;
        }

        let payload = serde_json::json!({
            "bead_id": change.bead_id,
            "repo": change.repo,
            "branch": change.branch,
            "old_status": change.old_status,
            "new_status": change.new_status,
            "title": change.title,
        })
        .to_string();

        for subscriber in subscribers {
            sqlx::query(
                r#"
                INSERT INTO notification_outbox
                    (id, project_id, event_type, payload, recipient_workspace_id,
                     recipient_alias, status, attempts, created_at)
                VALUES (?1, ?2, 'bead_status_change', ?3, ?4, ?5, 'pending', 0, ?6)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(project_id)
            .bind(&payload)
            .bind(subscriber.get::<String, _>("workspace_id"))
            .bind(subscriber.get::<String, _>("alias"))
            .bind(Utc::now().to_rfc3339())
            .execute(&mut **tx)
            .await?;
            entries_created += 1;
        }
    }

    Ok(entries_created)
}

/// Record an escalation-response notification for the raising workspace,
/// inside the caller's transaction.
pub async fn record_escalation_response(
    tx: &mut Transaction<'_, Sqlite>,
    project_id: &str,
    recipient_workspace_id: &str,
    recipient_alias: &str,
    escalation_id: &str,
    subject: &str,
    response: &str,
) -> ApiResult<()> {
    let payload = serde_json::json!({
        "escalation_id": escalation_id,
        "subject": subject,
        "response": response,
    })
    .to_string();

    sqlx::query(
        r#"
        INSERT INTO notification_outbox
            (id, project_id, event_type, payload, recipient_workspace_id,
             recipient_alias, status, attempts, created_at)
        VALUES (?1, ?2, 'escalation_responded', ?3, ?4, ?5, 'pending', 0, ?6)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(project_id)
    .bind(payload)
    .bind(recipient_workspace_id)
    .bind(recipient_alias)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct DrainStats {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OutboxCounts {
    pub pending: i64,
    pub dead: i64,
}

pub async fn counts(db: &Database, project_id: &str) -> ApiResult<OutboxCounts> {
    let row = sqlx::query(
        r#"
        SELECT
            SUM(CASE WHEN status IN ('pending', 'processing', 'failed') THEN 1 ELSE 0 END) AS pending,
            SUM(CASE WHEN status = 'dead' THEN 1 ELSE 0 END) AS dead
        FROM notification_outbox
        WHERE project_id = ?1
        "#,
    )
    .bind(project_id)
    .fetch_one(db.pool())
    .await?;
    Ok(OutboxCounts {
        pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
        dead: row.get::<Option<i64>, _>("dead").unwrap_or(0),
    })
}

/// Drain one batch of deliverable entries.
///
/// The claim step flips rows to `processing` and bumps `attempts` in a single
/// statement, so a second drainer running concurrently cannot pick up the
/// same rows (the SKIP LOCKED equivalent for this store). Rows whose attempt
/// budget is exhausted go to `dead` and stop blocking younger rows.
pub async fn drain_once(
    db: &Database,
    identity: &Arc<dyn IdentityAccess>,
    bus: &EventBus,
    config: &OutboxConfig,
) -> ApiResult<DrainStats> {
    let claimed = {
        let mut tx = db.pool().begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = 'processing', attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM notification_outbox
                WHERE status IN ('pending', 'failed') AND attempts < ?1
                ORDER BY created_at ASC
                LIMIT ?2
            )
            RETURNING id, project_id, event_type, payload, recipient_workspace_id,
                      recipient_alias, attempts
            "#,
        )
        .bind(config.max_attempts as i64)
        .bind(config.drain_batch_size as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows
    };

    let mut stats = DrainStats::default();

    for row in claimed {
        let outbox_id: String = row.get("id");
        let attempts: i64 = row.get("attempts");

        match deliver_entry(db, identity, bus, &row).await {
            Ok(message_id) => {
                sqlx::query(
                    r#"
                    UPDATE notification_outbox
                    SET status = 'completed', processed_at = ?2, message_id = ?3,
                        last_error = NULL
                    WHERE id = ?1
                    "#,
                )
                .bind(&outbox_id)
                .bind(Utc::now().to_rfc3339())
                .bind(&message_id)
                .execute(db.pool())
                .await?;
                stats.sent += 1;
            }
            Err(err) => {
                let exhausted = attempts >= config.max_attempts as i64;
                let status = if exhausted { "dead" } else { "failed" };
                tracing::warn!(
                    outbox_id,
                    attempts,
                    status,
                    error = %err,
                    "notification delivery failed"
                );
                let error_text: String = err.to_string().chars().take(500).collect();
                sqlx::query(
                    "UPDATE notification_outbox SET status = ?2, last_error = ?3 WHERE id = ?1",
                )
                .bind(&outbox_id)
                .bind(status)
                .bind(error_text)
                .execute(db.pool())
                .await?;
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

async fn deliver_entry(
    db: &Database,
    identity: &Arc<dyn IdentityAccess>,
    bus: &EventBus,
    row: &sqlx::sqlite::SqliteRow,
) -> anyhow::Result<String> {
    let project_id: String = row.get("project_id");
    let event_type: String = row.get("event_type");
    let recipient_workspace_id: String = row.get("recipient_workspace_id");
    let payload: Value = serde_json::from_str(&row.get::<String, _>("payload"))?;

    // Subscriptions can outlive workspaces; a gone recipient is a delivery
    // failure, not a crash.
    let recipient = sqlx::query(
        "SELECT agent_id, deleted_at FROM workspaces WHERE workspace_id = ?1 AND project_id = ?2",
    )
    .bind(&recipient_workspace_id)
    .bind(&project_id)
    .fetch_optional(db.pool())
    .await?;
    let recipient = recipient.ok_or_else(|| anyhow::anyhow!("recipient workspace not found"))?;
    if recipient.get::<Option<String>, _>("deleted_at").is_some() {
        anyhow::bail!("recipient workspace is deleted");
    }
    let recipient_agent_id: String = recipient.get("agent_id");

    let (subject, body, thread_id) = render_message(&event_type, &payload);

    let mut conn = db.pool().acquire().await?;
    let message_id = identity
        .deliver_message(
            &mut conn,
            &OutgoingMessage {
                project_id: project_id.clone(),
                from_agent_id: SENDER_AGENT_ID.to_string(),
                from_alias: SENDER_ALIAS.to_string(),
                to_agent_id: recipient_agent_id,
                subject: subject.clone(),
                body,
                priority: "normal".to_string(),
                thread_id,
            },
        )
        .await
        .map_err(|err| anyhow::anyhow!("mail handoff failed: {err}"))?;

    bus.publish(Event::now(
        &project_id,
        &recipient_workspace_id,
        EventKind::MessageDelivered {
            message_id: message_id.clone(),
            from_alias: SENDER_ALIAS.to_string(),
            subject,
        },
    ));

    Ok(message_id)
}

fn render_message(event_type: &str, payload: &Value) -> (String, String, Option<String>) {
    match event_type {
        "bead_status_change" => {
            let bead_id = payload["bead_id"].as_str().unwrap_or("unknown");
            let old_status = payload["old_status"].as_str().unwrap_or("unknown");
            let new_status = payload["new_status"].as_str().unwrap_or("unknown");

            let subject = format!("Bead status changed: {bead_id}");
            let mut body = format!(
                "**{bead_id}** status changed from `{old_status}` to `{new_status}`\n\n"
            );
            if let Some(title) = payload["title"].as_str() {
                body.push_str(&format!("Title: {title}\n"));
            }
            if let Some(repo) = payload["repo"].as_str() {
                body.push_str(&format!("Repo: {repo}\n"));
            }
            if let Some(branch) = payload["branch"].as_str() {
                body.push_str(&format!("Branch: {branch}\n"));
            }

            // One mail thread per bead, however many notifications it gets
            let thread_id =
                Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("bead:{bead_id}").as_bytes());
            (subject, body, Some(thread_id.to_string()))
        }
        "escalation_responded" => {
            let escalation_subject = payload["subject"].as_str().unwrap_or("(no subject)");
            let response = payload["response"].as_str().unwrap_or("");
            let subject = format!("Escalation answered: {escalation_subject}");
            let body = format!("Your escalation received a response:\n\n{response}\n");
            let thread_id = payload["escalation_id"]
                .as_str()
                .map(|id| Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("esc:{id}").as_bytes()))
                .map(|id| id.to_string());
            (subject, body, thread_id)
        }
        other => (
            format!("Notification: {other}"),
            payload.to_string(),
            None,
        ),
    }
}

/// Delete completed entries older than the retention window.
pub async fn prune_completed(db: &Database, retention_days: u32) -> ApiResult<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let result = sqlx::query(
        "DELETE FROM notification_outbox WHERE status = 'completed' AND processed_at < ?1",
    )
    .bind(cutoff.to_rfc3339())
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected() as usize)
}

/// Single background task owning the interval work: outbox drain, escalation
/// expiry, outbox pruning. Restart-safe because all of its state is the
/// durable status columns it re-reads each pass.
pub struct Sweeper {
    pub db: Database,
    pub identity: Arc<dyn IdentityAccess>,
    pub bus: EventBus,
    pub config: OutboxConfig,
}

impl Sweeper {
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.drain_interval_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                interval_seconds = self.config.drain_interval_seconds,
                "outbox sweeper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("outbox sweeper stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    async fn sweep_once(&self) {
        match drain_once(&self.db, &self.identity, &self.bus, &self.config).await {
            Ok(stats) if stats.sent + stats.failed > 0 => {
                tracing::info!(sent = stats.sent, failed = stats.failed, "outbox drained");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "outbox drain pass failed"),
        }

        if let Err(err) = crate::escalations::expire_pending(&self.db, &self.bus).await {
            tracing::warn!(error = %err, "escalation expiry pass failed");
        }

        match prune_completed(&self.db, self.config.retention_days).await {
            Ok(0) => {}
            Ok(pruned) => tracing::info!(pruned, "pruned completed outbox entries"),
            Err(err) => tracing::warn!(error = %err, "outbox prune pass failed"),
        }
    }
}
