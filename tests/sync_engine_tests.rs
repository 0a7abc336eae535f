mod common;

use common::{bound, init_workspace, item, test_db, test_state};

use beadhive::error::ApiError;
use beadhive::policies;
use beadhive::subscriptions;
use sqlx::Row;

#[tokio::test]
async fn first_writer_wins_second_claim_is_rejected_with_holder() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;
    assert_eq!(alice.project_id, bob.project_id);

    let outcome = state
        .engine
        .sync(&bound(&alice), "github.com/acme/widgets", "main", vec![item("demo-42", "in_progress")], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.claims_granted, vec!["demo-42".to_string()]);
    assert!(outcome.claims_rejected.is_empty());

    let outcome = state
        .engine
        .sync(&bound(&bob), "github.com/acme/widgets", "main", vec![item("demo-42", "in_progress")], &[], false)
        .await
        .unwrap();
    assert!(outcome.claims_granted.is_empty());
    assert_eq!(outcome.claims_rejected.len(), 1);
    let rejection = &outcome.claims_rejected[0];
    assert_eq!(rejection.bead_id, "demo-42");
    assert_eq!(rejection.held_by, alice.workspace_id);
    assert_eq!(rejection.holder_alias, "alice");

    // Exactly one active claim survives.
    let claims = state
        .engine
        .claims_for_workspace(&alice.workspace_id)
        .await
        .unwrap();
    assert_eq!(claims.len(), 1);
    let claims = state
        .engine
        .claims_for_workspace(&bob.workspace_id)
        .await
        .unwrap();
    assert!(claims.is_empty());
}

#[tokio::test]
async fn rejected_claim_update_is_not_applied() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;

    let alice_item = serde_json::from_value(serde_json::json!({
        "id": "demo-1", "status": "in_progress", "title": "alice's view"
    }))
    .unwrap();
    state
        .engine
        .sync(&bound(&alice), "repo.example/acme/w", "main", vec![alice_item], &[], false)
        .await
        .unwrap();

    let bob_item = serde_json::from_value(serde_json::json!({
        "id": "demo-1", "status": "in_progress", "title": "bob's view"
    }))
    .unwrap();
    state
        .engine
        .sync(&bound(&bob), "repo.example/acme/w", "main", vec![bob_item], &[], false)
        .await
        .unwrap();

    let row = sqlx::query("SELECT title FROM beads WHERE bead_id = 'demo-1'")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("title"), "alice's view");
}

#[tokio::test]
async fn claim_clears_when_holder_moves_off_in_progress() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;
    let repo = "github.com/acme/widgets";

    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-1", "in_progress")], &[], false)
        .await
        .unwrap();
    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-1", "closed")], &[], false)
        .await
        .unwrap();

    assert!(state
        .engine
        .claims_for_workspace(&alice.workspace_id)
        .await
        .unwrap()
        .is_empty());

    // The bead is free for bob now.
    let outcome = state
        .engine
        .sync(&bound(&bob), repo, "main", vec![item("bd-1", "in_progress")], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.claims_granted, vec!["bd-1".to_string()]);
}

#[tokio::test]
async fn sync_is_idempotent_including_outbox() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;
    let repo = "github.com/acme/widgets";

    // Bob watches bd-7; seed it so the next change notifies.
    subscriptions::subscribe(&db, &bound(&bob), "bd-7", None, None)
        .await
        .unwrap();
    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-7", "open")], &[], false)
        .await
        .unwrap();

    let outcome = state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-7", "in_progress")], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.outbox_entries, 1);

    // Replay: no new status change, no new outbox rows, same stored state.
    let outcome = state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-7", "in_progress")], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.outbox_entries, 0);
    assert!(outcome.status_changes.is_empty());

    let row = sqlx::query("SELECT COUNT(*) AS n FROM notification_outbox")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 1);
}

#[tokio::test]
async fn new_beads_do_not_notify_subscribers() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;

    subscriptions::subscribe(&db, &bound(&bob), "bd-new", None, None)
        .await
        .unwrap();

    let outcome = state
        .engine
        .sync(&bound(&alice), "r.example/a/w", "main", vec![item("bd-new", "open")], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.issues_added, 1);
    assert_eq!(outcome.status_changes.len(), 1); // recorded for events
    assert_eq!(outcome.outbox_entries, 0); // but not fanned out
}

#[tokio::test]
async fn stale_updates_are_skipped_and_reported() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;
    let repo = "github.com/acme/widgets";

    let fresh = serde_json::from_value(serde_json::json!({
        "id": "bd-9", "status": "open", "title": "fresh",
        "updated_at": "2026-02-01T12:00:00Z"
    }))
    .unwrap();
    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![fresh], &[], false)
        .await
        .unwrap();

    let stale = serde_json::from_value(serde_json::json!({
        "id": "bd-9", "status": "closed", "title": "stale",
        "updated_at": "2026-01-01T12:00:00Z"
    }))
    .unwrap();
    let outcome = state
        .engine
        .sync(&bound(&alice), repo, "main", vec![stale], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.conflicts, vec!["bd-9".to_string()]);
    assert_eq!(outcome.issues_updated, 0);

    let row = sqlx::query("SELECT title, status FROM beads WHERE bead_id = 'bd-9'")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("title"), "fresh");
    assert_eq!(row.get::<String, _>("status"), "open");
}

#[tokio::test]
async fn full_sync_does_not_delete_missing_items_but_deleted_ids_do() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;
    let repo = "github.com/acme/widgets";

    state
        .engine
        .sync(
            &bound(&alice),
            repo,
            "main",
            vec![item("bd-1", "open"), item("bd-2", "in_progress")],
            &[],
            false,
        )
        .await
        .unwrap();

    // A later full payload that only mentions bd-1 leaves bd-2 alone.
    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-1", "open")], &[], false)
        .await
        .unwrap();
    let row = sqlx::query("SELECT COUNT(*) AS n FROM beads")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 2);

    // Explicit deletion removes the row and its claim.
    let outcome = state
        .engine
        .sync(
            &bound(&alice),
            repo,
            "main",
            vec![],
            &["bd-2".to_string(), "not!!valid".to_string()],
            false,
        )
        .await
        .unwrap();
    assert_eq!(outcome.deleted, 1);
    let row = sqlx::query("SELECT COUNT(*) AS n FROM beads")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 1);
    assert!(state
        .engine
        .claims_for_workspace(&alice.workspace_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn coordinated_claims_need_item_flag_and_policy_flag() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;
    let repo = "github.com/acme/widgets";

    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-c", "in_progress")], &[], false)
        .await
        .unwrap();

    let coordinated_item = || {
        serde_json::from_value::<beadhive::beads::WorkItem>(serde_json::json!({
            "id": "bd-c", "status": "in_progress", "coordinated": true
        }))
        .unwrap()
    };

    // Item flag alone is not enough while policy forbids sharing.
    let outcome = state
        .engine
        .sync(&bound(&bob), repo, "main", vec![coordinated_item()], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.claims_rejected.len(), 1);

    // Both gates open: bob joins alice on the same bead.
    let outcome = state
        .engine
        .sync(&bound(&bob), repo, "main", vec![coordinated_item()], &[], true)
        .await
        .unwrap();
    assert!(outcome.claims_rejected.is_empty());
    assert_eq!(outcome.claims_granted, vec!["bd-c".to_string()]);

    let alice_claims = state
        .engine
        .claims_for_workspace(&alice.workspace_id)
        .await
        .unwrap();
    let bob_claims = state
        .engine
        .claims_for_workspace(&bob.workspace_id)
        .await
        .unwrap();
    assert_eq!(alice_claims.len(), 1);
    assert_eq!(bob_claims.len(), 1);
}

#[tokio::test]
async fn policy_flag_follows_the_active_bundle() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;

    // Default bundle forbids coordinated claims.
    let policy = policies::get_active_policy(&db, &alice.project_id).await.unwrap();
    assert!(!policy.bundle.settings.allow_coordinated_claims);

    let mut bundle = policy.bundle.clone();
    bundle.settings.allow_coordinated_claims = true;
    let updated = policies::create_policy_version(
        &db,
        &alice.project_id,
        &bundle,
        Some(&policy.policy_id),
        Some("test"),
    )
    .await
    .unwrap();
    assert_eq!(updated.version, policy.version + 1);

    let active = policies::get_active_policy(&db, &alice.project_id).await.unwrap();
    assert!(active.bundle.settings.allow_coordinated_claims);
}

#[tokio::test]
async fn deleted_holder_no_longer_blocks_claims() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());

    let alice = init_workspace(&state, "demo", "alice").await;
    let bob = init_workspace(&state, "demo", "bob").await;
    let repo = "github.com/acme/widgets";

    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item("bd-z", "in_progress")], &[], false)
        .await
        .unwrap();

    state
        .bootstrap
        .delete_workspace(&state.engine, &state.presence, &bound(&alice))
        .await
        .unwrap();

    let outcome = state
        .engine
        .sync(&bound(&bob), repo, "main", vec![item("bd-z", "in_progress")], &[], false)
        .await
        .unwrap();
    assert_eq!(outcome.claims_granted, vec!["bd-z".to_string()]);
}

#[tokio::test]
async fn workspace_deletion_makes_binding_return_gone() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    let alice = init_workspace(&state, "demo", "alice").await;

    state
        .bootstrap
        .delete_workspace(&state.engine, &state.presence, &bound(&alice))
        .await
        .unwrap();

    let identity = beadhive::auth::AuthIdentity {
        project_id: alice.project_id.clone(),
        agent_id: Some(alice.agent_id.clone()),
        actor_workspace_id: None,
        alias: Some(alice.alias.clone()),
        principal: beadhive::auth::Principal::ApiKey {
            key_id: alice.agent_id.clone(),
        },
    };
    let err = state
        .trust
        .bind_actor(&identity, &alice.workspace_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::WorkspaceGone));
}
