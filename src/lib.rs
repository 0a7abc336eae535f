// Beadhive - coordination server for multi-agent development
// This exposes the core components for testing and integration

pub mod auth;
pub mod beads;
pub mod config;
pub mod db;
pub mod error;
pub mod escalations;
pub mod events;
pub mod identity;
pub mod outbox;
pub mod policies;
pub mod presence;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod subscriptions;
pub mod telemetry;
pub mod workspaces;

// Re-export key types for easy access
pub use auth::{AuthIdentity, BoundWorkspace, Principal, TrustBoundary};
pub use beads::{SyncEngine, SyncMode, SyncOutcome, WorkItem};
pub use config::BeadhiveConfig;
pub use db::Database;
pub use error::{ApiError, ApiResult};
pub use events::{Event, EventBus, EventKind};
pub use identity::{EmbeddedIdentity, IdentityAccess};
pub use outbox::Sweeper;
pub use policies::{PolicyBundle, PolicyRecord};
pub use presence::{PresenceCache, PresenceFilter, PresenceRecord};
pub use server::{build_router, serve, AppState, Authenticated};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::init_telemetry;
pub use workspaces::{Bootstrap, InitOutcome, InitRequest};
