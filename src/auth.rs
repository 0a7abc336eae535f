use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::Row;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::db::Database;
use crate::error::{ApiError, ApiResult};
use crate::identity::IdentityAccess;

type HmacSha256 = Hmac<Sha256>;

pub const HDR_SIGNATURE: &str = "x-bh-auth";
pub const HDR_PROJECT: &str = "x-project-id";
pub const HDR_USER: &str = "x-user-id";
pub const HDR_API_KEY: &str = "x-api-key";
pub const HDR_ACTOR: &str = "x-aweb-actor-id";

/// Category of caller, used to scope visibility and permitted operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Proxy-asserted human user
    User { user_id: String },
    /// Service credential (proxy-asserted key id, or a direct bearer key)
    ApiKey { key_id: String },
    /// Anonymous read-only access to a public project; all
    /// personally-identifying fields are redacted from responses.
    PublicReader,
}

/// Resolved identity annotated onto every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub project_id: String,
    /// Identity-partition agent id (present in direct mode)
    pub agent_id: Option<String>,
    /// Acting workspace asserted by the proxy (present in proxy mode)
    pub actor_workspace_id: Option<String>,
    pub alias: Option<String>,
    pub principal: Principal,
}

impl AuthIdentity {
    pub fn is_public_reader(&self) -> bool {
        self.principal == Principal::PublicReader
    }
}

/// A workspace row as the trust boundary needs it for actor binding.
#[derive(Debug, Clone)]
pub struct BoundWorkspace {
    pub workspace_id: String,
    pub project_id: String,
    pub repo_id: String,
    pub agent_id: String,
    pub alias: String,
    pub role: String,
    pub human_name: Option<String>,
    pub deleted: bool,
}

/// Resolves inbound requests to an identity and enforces actor binding.
/// Purely functional over the request apart from the credential lookups.
#[derive(Clone)]
pub struct TrustBoundary {
    db: Database,
    identity: Arc<dyn IdentityAccess>,
    proxy_shared_secret: Option<String>,
}

impl TrustBoundary {
    pub fn new(
        db: Database,
        identity: Arc<dyn IdentityAccess>,
        proxy_shared_secret: Option<String>,
    ) -> Self {
        Self {
            db,
            identity,
            proxy_shared_secret,
        }
    }

    /// Mode selection is automatic: proxy headers plus a configured shared
    /// secret activate proxy mode, anything else is direct bearer mode.
    pub async fn authenticate(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> ApiResult<AuthIdentity> {
        if let Some(secret) = &self.proxy_shared_secret {
            if headers.contains_key(HDR_SIGNATURE) {
                return self.authenticate_proxy(secret, method, path, headers).await;
            }
        }
        self.authenticate_bearer(headers).await
    }

    async fn authenticate_bearer(&self, headers: &HeaderMap) -> ApiResult<AuthIdentity> {
        let raw_key = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthenticated)?;

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|_| ApiError::Unavailable)?;
        let agent = self
            .identity
            .resolve_api_key(&mut conn, raw_key)
            .await?
            .ok_or(ApiError::Unauthenticated)?;

        Ok(AuthIdentity {
            project_id: agent.project_id,
            agent_id: Some(agent.agent_id.clone()),
            actor_workspace_id: None,
            alias: Some(agent.alias),
            principal: Principal::ApiKey {
                key_id: agent.agent_id,
            },
        })
    }

    async fn authenticate_proxy(
        &self,
        secret: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
    ) -> ApiResult<AuthIdentity> {
        let signature = header_str(headers, HDR_SIGNATURE).ok_or(ApiError::Unauthenticated)?;
        let project_id = header_str(headers, HDR_PROJECT).ok_or_else(|| {
            ApiError::validation("proxy auth requires the project header")
        })?;

        let user_id = header_str(headers, HDR_USER);
        let api_key = header_str(headers, HDR_API_KEY);
        let actor = header_str(headers, HDR_ACTOR);

        let principal_header = user_id.clone().or_else(|| api_key.clone()).unwrap_or_default();
        let canonical = canonical_request(
            method,
            path,
            &project_id,
            &principal_header,
            actor.as_deref().unwrap_or_default(),
        );
        verify_signature(secret, &canonical, &signature)?;

        let principal = match (user_id, api_key) {
            (Some(user_id), _) => Principal::User { user_id },
            (None, Some(key_id)) => Principal::ApiKey { key_id },
            (None, None) => Principal::PublicReader,
        };

        let row = sqlx::query("SELECT visibility FROM projects WHERE id = ?1")
            .bind(&project_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(ApiError::NotFound("project"))?;
        let visibility: String = row.get("visibility");

        if principal == Principal::PublicReader {
            if visibility != "public" {
                return Err(ApiError::Unauthenticated);
            }
            if method != "GET" {
                return Err(ApiError::forbidden("public readers have read-only access"));
            }
        }

        Ok(AuthIdentity {
            project_id,
            agent_id: None,
            actor_workspace_id: actor,
            alias: None,
            principal,
        })
    }

    /// Enforce actor binding for a request that asserts a workspace_id:
    /// the resolved credential must belong to that workspace. Runs before
    /// any storage mutation. Returns the bound workspace for reuse.
    pub async fn bind_actor(
        &self,
        identity: &AuthIdentity,
        workspace_id: &str,
    ) -> ApiResult<BoundWorkspace> {
        let workspace = self
            .fetch_workspace(workspace_id)
            .await?
            .ok_or(ApiError::NotFound("workspace"))?;

        if workspace.project_id != identity.project_id {
            return Err(ApiError::forbidden("workspace belongs to another project"));
        }

        let bound = match (&identity.agent_id, &identity.actor_workspace_id) {
            (Some(agent_id), _) => &workspace.agent_id == agent_id,
            (None, Some(actor)) => &workspace.workspace_id == actor,
            (None, None) => false,
        };
        if !bound {
            return Err(ApiError::forbidden(
                "credential is not bound to the asserted workspace",
            ));
        }

        if workspace.deleted {
            return Err(ApiError::WorkspaceGone);
        }

        Ok(workspace)
    }

    pub async fn fetch_workspace(&self, workspace_id: &str) -> ApiResult<Option<BoundWorkspace>> {
        let row = sqlx::query(
            r#"
            SELECT workspace_id, project_id, repo_id, agent_id, alias, role,
                   human_name, deleted_at
            FROM workspaces
            WHERE workspace_id = ?1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|row| BoundWorkspace {
            workspace_id: row.get("workspace_id"),
            project_id: row.get("project_id"),
            repo_id: row.get("repo_id"),
            agent_id: row.get("agent_id"),
            alias: row.get("alias"),
            role: row.get("role"),
            human_name: row.get("human_name"),
            deleted: row.get::<Option<String>, _>("deleted_at").is_some(),
        }))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|value| !value.is_empty())
}

/// Canonical representation covered by the proxy signature. Newline-joined so
/// no field can bleed into its neighbor.
fn canonical_request(
    method: &str,
    path: &str,
    project_id: &str,
    principal: &str,
    actor: &str,
) -> String {
    format!("{method}\n{path}\n{project_id}\n{principal}\n{actor}")
}

fn verify_signature(secret: &str, canonical: &str, signature_hex: &str) -> ApiResult<()> {
    let provided = hex::decode(signature_hex).map_err(|_| ApiError::Unauthenticated)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::Unauthenticated)?;
    mac.update(canonical.as_bytes());
    let expected = mac.finalize().into_bytes();

    if bool::from(expected.as_slice().ct_eq(&provided)) {
        Ok(())
    } else {
        Err(ApiError::Unauthenticated)
    }
}

/// Compute the proxy signature for a request. Exposed so the relay (and
/// tests) can produce valid header sets.
pub fn sign_request(
    secret: &str,
    method: &str,
    path: &str,
    project_id: &str,
    principal: &str,
    actor: &str,
) -> String {
    let canonical = canonical_request(method, path, project_id, principal, actor);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip() {
        let sig = sign_request("topsecret", "POST", "/v1/bdh/sync", "proj", "user-1", "ws-1");
        let canonical = canonical_request("POST", "/v1/bdh/sync", "proj", "user-1", "ws-1");
        assert!(verify_signature("topsecret", &canonical, &sig).is_ok());
        assert!(verify_signature("wrong", &canonical, &sig).is_err());
    }

    #[test]
    fn tampered_fields_break_the_signature() {
        let sig = sign_request("topsecret", "POST", "/v1/bdh/sync", "proj", "user-1", "ws-1");
        let canonical = canonical_request("POST", "/v1/bdh/sync", "proj", "user-1", "ws-2");
        assert!(verify_signature("topsecret", &canonical, &sig).is_err());
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(verify_signature("s", "c", "not-hex!").is_err());
    }
}
