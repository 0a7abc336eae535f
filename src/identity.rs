use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::error::ApiResult;

/// Prefix for issued API keys. The raw key is returned exactly once at issue
/// time; only its hash is stored.
pub const API_KEY_PREFIX: &str = "bh_sk_";

/// An agent identity as the identity partition knows it.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub project_id: String,
    pub alias: String,
    pub human_name: Option<String>,
    pub agent_type: String,
}

/// Parameters for a mail handoff.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub project_id: String,
    pub from_agent_id: String,
    pub from_alias: String,
    pub to_agent_id: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    pub thread_id: Option<String>,
}

/// Accessor interface over the identity partition.
///
/// The coordination engine owns nothing in that partition and reaches it only
/// through this trait; every method runs on a caller-provided connection so
/// identity writes can join the caller's transaction (bootstrap atomicity
/// depends on this).
#[async_trait]
pub trait IdentityAccess: Send + Sync {
    /// Create an agent record. Returns the new agent id.
    async fn create_agent(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        alias: &str,
        human_name: Option<&str>,
        agent_type: &str,
    ) -> ApiResult<String>;

    /// Issue a fresh API key for an agent. Returns the raw key.
    async fn issue_api_key(
        &self,
        conn: &mut SqliteConnection,
        agent_id: &str,
    ) -> ApiResult<String>;

    /// Resolve a bearer credential to an agent, or None if unknown, expired,
    /// or revoked.
    async fn resolve_api_key(
        &self,
        conn: &mut SqliteConnection,
        raw_key: &str,
    ) -> ApiResult<Option<AgentRecord>>;

    /// Hand a message to the mail system. Returns the message id.
    async fn deliver_message(
        &self,
        conn: &mut SqliteConnection,
        message: &OutgoingMessage,
    ) -> ApiResult<String>;
}

/// Embedded implementation backed by the `id_*` tables in the shared
/// database.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedIdentity;

impl EmbeddedIdentity {
    pub fn new() -> Self {
        Self
    }
}

fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn generate_key() -> String {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

#[async_trait]
impl IdentityAccess for EmbeddedIdentity {
    async fn create_agent(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        alias: &str,
        human_name: Option<&str>,
        agent_type: &str,
    ) -> ApiResult<String> {
        let agent_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO id_agents (agent_id, project_id, alias, human_name, agent_type, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&agent_id)
        .bind(project_id)
        .bind(alias)
        .bind(human_name)
        .bind(agent_type)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
        Ok(agent_id)
    }

    async fn issue_api_key(
        &self,
        conn: &mut SqliteConnection,
        agent_id: &str,
    ) -> ApiResult<String> {
        let raw = generate_key();
        sqlx::query(
            r#"
            INSERT INTO id_api_keys (key_id, agent_id, key_hash, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(agent_id)
        .bind(hash_key(&raw))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
        Ok(raw)
    }

    async fn resolve_api_key(
        &self,
        conn: &mut SqliteConnection,
        raw_key: &str,
    ) -> ApiResult<Option<AgentRecord>> {
        if !raw_key.starts_with(API_KEY_PREFIX) {
            return Ok(None);
        }
        let now = Utc::now().to_rfc3339();
        let row = sqlx::query(
            r#"
            SELECT a.agent_id, a.project_id, a.alias, a.human_name, a.agent_type
            FROM id_api_keys k
            JOIN id_agents a ON a.agent_id = k.agent_id
            WHERE k.key_hash = ?1
              AND k.revoked_at IS NULL
              AND (k.expires_at IS NULL OR k.expires_at > ?2)
            "#,
        )
        .bind(hash_key(raw_key))
        .bind(&now)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|row| AgentRecord {
            agent_id: row.get("agent_id"),
            project_id: row.get("project_id"),
            alias: row.get("alias"),
            human_name: row.get("human_name"),
            agent_type: row.get("agent_type"),
        }))
    }

    async fn deliver_message(
        &self,
        conn: &mut SqliteConnection,
        message: &OutgoingMessage,
    ) -> ApiResult<String> {
        let message_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO id_messages
                (message_id, project_id, from_agent_id, from_alias, to_agent_id,
                 subject, body, priority, thread_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&message_id)
        .bind(&message.project_id)
        .bind(&message.from_agent_id)
        .bind(&message.from_alias)
        .bind(&message.to_agent_id)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(&message.priority)
        .bind(&message.thread_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *conn)
        .await?;
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_prefixed_and_unique() {
        let a = generate_key();
        let b = generate_key();
        assert!(a.starts_with(API_KEY_PREFIX));
        assert_eq!(a.len(), API_KEY_PREFIX.len() + 40);
        assert_ne!(a, b);
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(hash_key("bh_sk_abc"), hash_key("bh_sk_abc"));
        assert_ne!(hash_key("bh_sk_abc"), hash_key("bh_sk_abd"));
    }
}
