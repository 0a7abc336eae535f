mod common;

use std::sync::Arc;

use axum::http::HeaderMap;
use common::{init_workspace, test_db, test_state};

use beadhive::auth::{sign_request, Principal, TrustBoundary};
use beadhive::error::ApiError;
use beadhive::identity::EmbeddedIdentity;
use sqlx::Row;

fn bearer_headers(key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", format!("Bearer {key}").parse().unwrap());
    headers
}

#[tokio::test]
async fn bearer_key_resolves_to_its_agent() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;

    let identity = state
        .trust
        .authenticate("POST", "/v1/bdh/sync", &bearer_headers(&alice.api_key))
        .await
        .unwrap();
    assert_eq!(identity.project_id, alice.project_id);
    assert_eq!(identity.agent_id.as_deref(), Some(alice.agent_id.as_str()));
    assert_eq!(identity.alias.as_deref(), Some("alice"));
}

#[tokio::test]
async fn missing_or_unknown_bearer_is_unauthenticated() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let err = state
        .trust
        .authenticate("GET", "/v1/status", &HeaderMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated));

    let err = state
        .trust
        .authenticate("GET", "/v1/status", &bearer_headers("bh_sk_deadbeef"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated));
}

#[tokio::test]
async fn actor_binding_rejects_foreign_workspaces_before_any_mutation() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;

    let identity = state
        .trust
        .authenticate("POST", "/v1/bdh/sync", &bearer_headers(&alice.api_key))
        .await
        .unwrap();

    // Alice's credential asserting bob's workspace is forbidden.
    let err = state
        .trust
        .bind_actor(&identity, &bob.workspace_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));

    // Nothing was written on the way to the rejection.
    let row = sqlx::query("SELECT COUNT(*) AS n FROM beads")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 0);

    // Binding to her own workspace succeeds.
    let workspace = state
        .trust
        .bind_actor(&identity, &alice.workspace_id)
        .await
        .unwrap();
    assert_eq!(workspace.alias, "alice");
}

fn proxy_headers(
    secret: &str,
    method: &str,
    path: &str,
    project_id: &str,
    user_id: Option<&str>,
    actor: Option<&str>,
) -> HeaderMap {
    let principal = user_id.unwrap_or_default();
    let signature = sign_request(
        secret,
        method,
        path,
        project_id,
        principal,
        actor.unwrap_or_default(),
    );
    let mut headers = HeaderMap::new();
    headers.insert("x-bh-auth", signature.parse().unwrap());
    headers.insert("x-project-id", project_id.parse().unwrap());
    if let Some(user_id) = user_id {
        headers.insert("x-user-id", user_id.parse().unwrap());
    }
    if let Some(actor) = actor {
        headers.insert("x-aweb-actor-id", actor.parse().unwrap());
    }
    headers
}

#[tokio::test]
async fn proxy_mode_accepts_signed_headers_and_rejects_tampering() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;

    let trust = TrustBoundary::new(
        db.clone(),
        Arc::new(EmbeddedIdentity::new()),
        Some("topsecret".to_string()),
    );

    let headers = proxy_headers(
        "topsecret",
        "POST",
        "/v1/bdh/sync",
        &alice.project_id,
        Some("user-7"),
        Some(&alice.workspace_id),
    );
    let identity = trust
        .authenticate("POST", "/v1/bdh/sync", &headers)
        .await
        .unwrap();
    assert_eq!(identity.project_id, alice.project_id);
    assert_eq!(
        identity.principal,
        Principal::User {
            user_id: "user-7".to_string()
        }
    );
    assert_eq!(
        identity.actor_workspace_id.as_deref(),
        Some(alice.workspace_id.as_str())
    );

    // Proxy-asserted actor binds like a direct credential would.
    let workspace = trust
        .bind_actor(&identity, &alice.workspace_id)
        .await
        .unwrap();
    assert_eq!(workspace.alias, "alice");

    // Signature over different fields does not transfer.
    let err = trust
        .authenticate("POST", "/v1/policies", &headers)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated));

    // Wrong secret on the signing side fails too.
    let forged = proxy_headers(
        "wrongsecret",
        "POST",
        "/v1/bdh/sync",
        &alice.project_id,
        Some("user-7"),
        Some(&alice.workspace_id),
    );
    let err = trust
        .authenticate("POST", "/v1/bdh/sync", &forged)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated));
}

#[tokio::test]
async fn proxy_mode_is_inert_without_a_configured_secret() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;

    // State's trust boundary has no shared secret; the signed header set
    // falls through to bearer mode and fails for lack of a credential.
    let headers = proxy_headers(
        "topsecret",
        "GET",
        "/v1/status",
        &alice.project_id,
        Some("user-7"),
        None,
    );
    let err = state
        .trust
        .authenticate("GET", "/v1/status", &headers)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated));
}

#[tokio::test]
async fn public_reader_requires_public_project_and_read_only_access() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;

    let trust = TrustBoundary::new(
        db.clone(),
        Arc::new(EmbeddedIdentity::new()),
        Some("topsecret".to_string()),
    );

    // Private project: anonymous reads are refused.
    let headers = proxy_headers("topsecret", "GET", "/v1/status", &alice.project_id, None, None);
    let err = trust
        .authenticate("GET", "/v1/status", &headers)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unauthenticated));

    sqlx::query("UPDATE projects SET visibility = 'public' WHERE id = ?1")
        .bind(&alice.project_id)
        .execute(db.pool())
        .await
        .unwrap();

    // Public project: reads resolve to the PublicReader principal.
    let identity = trust
        .authenticate("GET", "/v1/status", &headers)
        .await
        .unwrap();
    assert!(identity.is_public_reader());

    // Writes never do.
    let headers = proxy_headers("topsecret", "POST", "/v1/policies", &alice.project_id, None, None);
    let err = trust
        .authenticate("POST", "/v1/policies", &headers)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden(_)));
}
