use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel. Lagging receivers drop old
/// events; the cache and the relational store remain the source of truth.
const CHANNEL_CAPACITY: usize = 256;

/// The closed set of event payloads this server emits, plus an opaque
/// fallback for payloads produced outside the engine (e.g. forwarded
/// mutation hooks) that we relay without interpreting.
#[derive(Debug, Clone)]
pub enum EventKind {
    BeadStatusChanged {
        bead_id: String,
        repo: String,
        branch: String,
        old_status: Option<String>,
        new_status: String,
        title: Option<String>,
    },
    ClaimAcquired {
        bead_id: String,
        alias: String,
        coordinated: bool,
    },
    ClaimReleased {
        bead_id: String,
        alias: String,
    },
    EscalationCreated {
        escalation_id: String,
        alias: String,
        subject: String,
    },
    EscalationResponded {
        escalation_id: String,
        response: String,
    },
    MessageDelivered {
        message_id: String,
        from_alias: String,
        subject: String,
    },
    PresenceUpdated {
        alias: String,
        repo: String,
        branch: String,
    },
    Opaque {
        event_type: String,
        payload: Value,
    },
}

impl EventKind {
    pub fn event_type(&self) -> String {
        match self {
            EventKind::BeadStatusChanged { .. } => "bead.status_changed".to_string(),
            EventKind::ClaimAcquired { .. } => "claim.acquired".to_string(),
            EventKind::ClaimReleased { .. } => "claim.released".to_string(),
            EventKind::EscalationCreated { .. } => "escalation.created".to_string(),
            EventKind::EscalationResponded { .. } => "escalation.responded".to_string(),
            EventKind::MessageDelivered { .. } => "message.delivered".to_string(),
            EventKind::PresenceUpdated { .. } => "presence.updated".to_string(),
            EventKind::Opaque { event_type, .. } => event_type.clone(),
        }
    }

    fn data(&self) -> Value {
        match self {
            EventKind::BeadStatusChanged {
                bead_id,
                repo,
                branch,
                old_status,
                new_status,
                title,
            } => json!({
                "bead_id": bead_id,
                "repo": repo,
                "branch": branch,
                "old_status": old_status,
                "new_status": new_status,
                "title": title,
            }),
            EventKind::ClaimAcquired {
                bead_id,
                alias,
                coordinated,
            } => json!({ "bead_id": bead_id, "alias": alias, "coordinated": coordinated }),
            EventKind::ClaimReleased { bead_id, alias } => {
                json!({ "bead_id": bead_id, "alias": alias })
            }
            EventKind::EscalationCreated {
                escalation_id,
                alias,
                subject,
            } => json!({ "escalation_id": escalation_id, "alias": alias, "subject": subject }),
            EventKind::EscalationResponded {
                escalation_id,
                response,
            } => json!({ "escalation_id": escalation_id, "response": response }),
            EventKind::MessageDelivered {
                message_id,
                from_alias,
                subject,
            } => json!({ "message_id": message_id, "from_alias": from_alias, "subject": subject }),
            EventKind::PresenceUpdated {
                alias,
                repo,
                branch,
            } => json!({ "alias": alias, "repo": repo, "branch": branch }),
            EventKind::Opaque { payload, .. } => payload.clone(),
        }
    }
}

/// Envelope published on the bus and written to SSE streams.
#[derive(Debug, Clone)]
pub struct Event {
    pub project_id: String,
    pub workspace_id: String,
    pub timestamp: String,
    pub kind: EventKind,
}

impl Event {
    pub fn now(project_id: &str, workspace_id: &str, kind: EventKind) -> Self {
        Self {
            project_id: project_id.to_string(),
            workspace_id: workspace_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind,
        }
    }

    /// Category is the segment before the first '.', e.g.
    /// "bead.status_changed" -> "bead". Used for SSE type filtering.
    pub fn category(&self) -> String {
        let event_type = self.kind.event_type();
        event_type
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "type": self.kind.event_type(),
            "project_id": self.project_id,
            "workspace_id": self.workspace_id,
            "timestamp": self.timestamp,
        });
        if let (Some(obj), Some(data)) = (body.as_object_mut(), self.kind.data().as_object()) {
            for (k, v) in data {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        body
    }
}

/// Fire-and-forget pub/sub fan-out for real-time streaming.
///
/// A send with no receivers is not an error; a lagging receiver misses
/// events until its next poll cycle, which §4.5 explicitly allows.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let event_type = event.kind.event_type();
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::debug!(event = %event_type, receivers, "published event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_merges_kind_fields() {
        let event = Event::now(
            "proj-1",
            "ws-1",
            EventKind::BeadStatusChanged {
                bead_id: "bd-1".into(),
                repo: "github.com/org/repo".into(),
                branch: "main".into(),
                old_status: Some("open".into()),
                new_status: "in_progress".into(),
                title: None,
            },
        );
        let value = event.to_json();
        assert_eq!(value["type"], "bead.status_changed");
        assert_eq!(value["bead_id"], "bd-1");
        assert_eq!(value["project_id"], "proj-1");
        assert_eq!(event.category(), "bead");
    }

    #[test]
    fn opaque_events_keep_their_type() {
        let event = Event::now(
            "proj-1",
            "ws-1",
            EventKind::Opaque {
                event_type: "reservation.acquired".into(),
                payload: json!({"paths": ["src/lib.rs"]}),
            },
        );
        assert_eq!(event.kind.event_type(), "reservation.acquired");
        assert_eq!(event.category(), "reservation");
        assert_eq!(event.to_json()["paths"][0], "src/lib.rs");
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::now(
            "proj-1",
            "ws-1",
            EventKind::ClaimReleased {
                bead_id: "bd-9".into(),
                alias: "alice".into(),
            },
        ));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind.event_type(), "claim.released");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Event::now(
            "proj-1",
            "ws-1",
            EventKind::ClaimReleased {
                bead_id: "bd-9".into(),
                alias: "alice".into(),
            },
        ));
    }
}
