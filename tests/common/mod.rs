#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tempfile::TempDir;

use beadhive::auth::BoundWorkspace;
use beadhive::config::{BeadhiveConfig, DatabaseConfig};
use beadhive::db::Database;
use beadhive::error::{ApiError, ApiResult};
use beadhive::identity::{AgentRecord, EmbeddedIdentity, IdentityAccess, OutgoingMessage};
use beadhive::server::AppState;
use beadhive::workspaces::{InitOutcome, InitRequest};

pub const TEST_REPO_ORIGIN: &str = "git@github.com:acme/widgets.git";

/// Fresh file-backed database in a temp dir (in-memory SQLite would give
/// each pooled connection its own database).
pub async fn test_db() -> (Database, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let config = DatabaseConfig {
        url: dir.path().join("test.db").to_string_lossy().into_owned(),
        max_connections: 5,
        auto_migrate: true,
    };
    let db = Database::connect(&config).await.expect("connect test db");
    (db, dir)
}

pub fn test_config() -> BeadhiveConfig {
    let mut config = BeadhiveConfig::default();
    config.server.init_rate_limit = 1000;
    config.outbox.drain_interval_seconds = 3600; // tests drain explicitly
    config
}

pub fn test_state(db: Database) -> AppState {
    AppState::new(test_config(), db, Arc::new(EmbeddedIdentity::new()))
}

pub fn init_request(slug: &str, alias: &str, role: &str) -> InitRequest {
    serde_json::from_value(serde_json::json!({
        "project_slug": slug,
        "project_name": slug,
        "repo_origin": TEST_REPO_ORIGIN,
        "alias": alias,
        "human_name": "Test Human",
        "role": role,
    }))
    .expect("valid init request")
}

/// Bootstrap a workspace and return its init outcome.
pub async fn init_workspace(state: &AppState, slug: &str, alias: &str) -> InitOutcome {
    state
        .bootstrap
        .init(&init_request(slug, alias, "agent"))
        .await
        .expect("bootstrap workspace")
}

/// The BoundWorkspace the trust boundary would hand to a handler.
pub fn bound(outcome: &InitOutcome) -> BoundWorkspace {
    BoundWorkspace {
        workspace_id: outcome.workspace_id.clone(),
        project_id: outcome.project_id.clone(),
        repo_id: outcome.repo_id.clone(),
        agent_id: outcome.agent_id.clone(),
        alias: outcome.alias.clone(),
        role: "agent".to_string(),
        human_name: Some("Test Human".to_string()),
        deleted: false,
    }
}

pub fn item(id: &str, status: &str) -> beadhive::beads::WorkItem {
    serde_json::from_value(serde_json::json!({ "id": id, "status": status }))
        .expect("valid work item")
}

/// Identity access that fails at credential issue time; used to prove
/// bootstrap rolls the whole transaction back.
pub struct FailingKeyIdentity {
    inner: EmbeddedIdentity,
}

impl FailingKeyIdentity {
    pub fn new() -> Self {
        Self {
            inner: EmbeddedIdentity::new(),
        }
    }
}

#[async_trait]
impl IdentityAccess for FailingKeyIdentity {
    async fn create_agent(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        alias: &str,
        human_name: Option<&str>,
        agent_type: &str,
    ) -> ApiResult<String> {
        self.inner
            .create_agent(conn, project_id, alias, human_name, agent_type)
            .await
    }

    async fn issue_api_key(&self, _conn: &mut SqliteConnection, _agent_id: &str) -> ApiResult<String> {
        Err(ApiError::Internal(anyhow::anyhow!(
            "injected credential failure"
        )))
    }

    async fn resolve_api_key(
        &self,
        conn: &mut SqliteConnection,
        raw_key: &str,
    ) -> ApiResult<Option<AgentRecord>> {
        self.inner.resolve_api_key(conn, raw_key).await
    }

    async fn deliver_message(
        &self,
        conn: &mut SqliteConnection,
        message: &OutgoingMessage,
    ) -> ApiResult<String> {
        self.inner.deliver_message(conn, message).await
    }
}

/// Identity access whose mail handoff always fails; used for outbox retry
/// and dead-letter tests.
pub struct UnreachableMailIdentity {
    inner: EmbeddedIdentity,
}

impl UnreachableMailIdentity {
    pub fn new() -> Self {
        Self {
            inner: EmbeddedIdentity::new(),
        }
    }
}

#[async_trait]
impl IdentityAccess for UnreachableMailIdentity {
    async fn create_agent(
        &self,
        conn: &mut SqliteConnection,
        project_id: &str,
        alias: &str,
        human_name: Option<&str>,
        agent_type: &str,
    ) -> ApiResult<String> {
        self.inner
            .create_agent(conn, project_id, alias, human_name, agent_type)
            .await
    }

    async fn issue_api_key(&self, conn: &mut SqliteConnection, agent_id: &str) -> ApiResult<String> {
        self.inner.issue_api_key(conn, agent_id).await
    }

    async fn resolve_api_key(
        &self,
        conn: &mut SqliteConnection,
        raw_key: &str,
    ) -> ApiResult<Option<AgentRecord>> {
        self.inner.resolve_api_key(conn, raw_key).await
    }

    async fn deliver_message(
        &self,
        _conn: &mut SqliteConnection,
        _message: &OutgoingMessage,
    ) -> ApiResult<String> {
        Err(ApiError::Unavailable)
    }
}
