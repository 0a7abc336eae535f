mod common;

use std::sync::Arc;

use common::{bound, init_workspace, item, test_db, test_state, UnreachableMailIdentity};

use beadhive::events::EventBus;
use beadhive::identity::{EmbeddedIdentity, IdentityAccess};
use beadhive::outbox;
use beadhive::subscriptions;
use sqlx::Row;

async fn seed_pending_entry(
    state: &beadhive::server::AppState,
    db: &beadhive::db::Database,
    bead_id: &str,
) {
    let alice = init_workspace(state, "demo", "alice").await;
    let bob = init_workspace(state, "demo", "bob").await;
    subscriptions::subscribe(db, &bound(&bob), bead_id, None, None)
        .await
        .unwrap();
    let repo = "github.com/acme/widgets";
    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item(bead_id, "open")], &[], false)
        .await
        .unwrap();
    state
        .engine
        .sync(&bound(&alice), repo, "main", vec![item(bead_id, "in_progress")], &[], false)
        .await
        .unwrap();
}

#[tokio::test]
async fn drain_delivers_and_marks_completed() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    seed_pending_entry(&state, &db, "bd-1").await;

    let identity: Arc<dyn IdentityAccess> = Arc::new(EmbeddedIdentity::new());
    let stats = outbox::drain_once(&db, &identity, &EventBus::new(), &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 0);

    let row = sqlx::query("SELECT status, message_id, attempts FROM notification_outbox")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "completed");
    assert!(row.get::<Option<String>, _>("message_id").is_some());
    assert_eq!(row.get::<i64, _>("attempts"), 1);

    // The handoff landed in the mail partition.
    let mail = sqlx::query("SELECT subject, thread_id FROM id_messages")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(
        mail.get::<String, _>("subject"),
        "Bead status changed: bd-1"
    );
    assert!(mail.get::<Option<String>, _>("thread_id").is_some());

    // Nothing left to drain.
    let stats = outbox::drain_once(&db, &identity, &EventBus::new(), &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.sent + stats.failed, 0);
}

#[tokio::test]
async fn repeated_failures_retry_then_dead_letter() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    seed_pending_entry(&state, &db, "bd-2").await;

    let broken: Arc<dyn IdentityAccess> = Arc::new(UnreachableMailIdentity::new());
    let bus = EventBus::new();

    // First two failures stay retriable.
    for expected_status in ["failed", "failed"] {
        let stats = outbox::drain_once(&db, &broken, &bus, &state.config.outbox)
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        let row = sqlx::query("SELECT status, last_error FROM notification_outbox")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("status"), expected_status);
        assert!(row.get::<Option<String>, _>("last_error").is_some());
    }

    // Third failure exhausts the budget: dead, surfaced, not retried.
    let stats = outbox::drain_once(&db, &broken, &bus, &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    let row = sqlx::query("SELECT status, attempts FROM notification_outbox")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "dead");
    assert_eq!(row.get::<i64, _>("attempts"), 3);

    let stats = outbox::drain_once(&db, &broken, &bus, &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.sent + stats.failed, 0);

    let project: String = sqlx::query("SELECT project_id FROM notification_outbox")
        .fetch_one(db.pool())
        .await
        .unwrap()
        .get("project_id");
    let counts = outbox::counts(&db, &project).await.unwrap();
    assert_eq!(counts.dead, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn dead_letters_do_not_block_younger_entries() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    seed_pending_entry(&state, &db, "bd-3").await;

    // Exhaust the first entry.
    let broken: Arc<dyn IdentityAccess> = Arc::new(UnreachableMailIdentity::new());
    let bus = EventBus::new();
    for _ in 0..3 {
        outbox::drain_once(&db, &broken, &bus, &state.config.outbox)
            .await
            .unwrap();
    }

    // A younger entry arrives and delivers fine.
    let alice = bound(&init_workspace(&state, "demo", "alice").await);
    state
        .engine
        .sync(&alice, "github.com/acme/widgets", "main", vec![item("bd-3", "closed")], &[], false)
        .await
        .unwrap();

    let healthy: Arc<dyn IdentityAccess> = Arc::new(EmbeddedIdentity::new());
    let stats = outbox::drain_once(&db, &healthy, &bus, &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.sent, 1);
}

#[tokio::test]
async fn deleted_recipient_counts_as_delivery_failure() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    seed_pending_entry(&state, &db, "bd-4").await;

    // Soft-delete the subscriber before the drain runs.
    let bob = state
        .trust
        .fetch_workspace(
            &sqlx::query("SELECT recipient_workspace_id FROM notification_outbox")
                .fetch_one(db.pool())
                .await
                .unwrap()
                .get::<String, _>("recipient_workspace_id"),
        )
        .await
        .unwrap()
        .unwrap();
    state
        .bootstrap
        .delete_workspace(&state.engine, &state.presence, &bob)
        .await
        .unwrap();

    let healthy: Arc<dyn IdentityAccess> = Arc::new(EmbeddedIdentity::new());
    let stats = outbox::drain_once(&db, &healthy, &EventBus::new(), &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn claimed_entries_are_invisible_to_other_drain_passes() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    seed_pending_entry(&state, &db, "bd-6").await;

    // Simulate another drainer holding the entry mid-delivery.
    sqlx::query("UPDATE notification_outbox SET status = 'processing', attempts = 1")
        .execute(db.pool())
        .await
        .unwrap();

    let healthy: Arc<dyn IdentityAccess> = Arc::new(EmbeddedIdentity::new());
    let stats = outbox::drain_once(&db, &healthy, &EventBus::new(), &state.config.outbox)
        .await
        .unwrap();
    assert_eq!(stats.sent + stats.failed, 0);

    let row = sqlx::query("SELECT COUNT(*) AS n FROM id_messages")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("n"), 0);
}

#[tokio::test]
async fn prune_removes_only_old_completed_entries() {
    let (db, _dir) = test_db().await;
    let state = test_state(db.clone());
    seed_pending_entry(&state, &db, "bd-5").await;

    let healthy: Arc<dyn IdentityAccess> = Arc::new(EmbeddedIdentity::new());
    outbox::drain_once(&db, &healthy, &EventBus::new(), &state.config.outbox)
        .await
        .unwrap();

    // Fresh completed entries survive.
    assert_eq!(outbox::prune_completed(&db, 7).await.unwrap(), 0);

    // Age the entry past the retention window.
    sqlx::query("UPDATE notification_outbox SET processed_at = '2020-01-01T00:00:00Z'")
        .execute(db.pool())
        .await
        .unwrap();
    assert_eq!(outbox::prune_completed(&db, 7).await.unwrap(), 1);
}
