use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use moka::future::Cache;
use moka::Expiry;
use serde::Serialize;

use crate::config::PresenceConfig;
use crate::events::{Event, EventBus, EventKind};

/// Ephemeral liveness record for one workspace. Best-effort only: the
/// relational store never consults this for correctness.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceRecord {
    pub workspace_id: String,
    pub project_id: String,
    pub repo: String,
    pub branch: String,
    pub alias: String,
    pub role: String,
    pub hostname: Option<String>,
    pub last_seen: String,
}

/// Lookup filter; more specific fields narrow which index is consulted.
#[derive(Debug, Clone, Default)]
pub struct PresenceFilter {
    pub project_id: String,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub alias: Option<String>,
}

#[derive(Clone)]
enum CacheEntry {
    Primary {
        record: PresenceRecord,
        ttl: Duration,
    },
    /// Secondary index: workspace ids sharing one (project/repo/branch/alias)
    /// dimension. Lives longer than the primaries it points at, so members
    /// whose primary is gone are stale and filtered at read time.
    Index {
        members: BTreeSet<String>,
        ttl: Duration,
    },
}

impl CacheEntry {
    fn ttl(&self) -> Duration {
        match self {
            CacheEntry::Primary { ttl, .. } | CacheEntry::Index { ttl, .. } => *ttl,
        }
    }
}

struct PerEntryExpiry;

impl Expiry<String, CacheEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl())
    }
}

fn primary_key(workspace_id: &str) -> String {
    format!("ws:{workspace_id}")
}

/// The presence cache: one primary record per workspace plus index sets per
/// project, repo, branch, and alias, each with an independent TTL.
#[derive(Clone)]
pub struct PresenceCache {
    cache: Cache<String, CacheEntry>,
    primary_ttl: Duration,
    index_ttl: Duration,
    bus: EventBus,
}

impl PresenceCache {
    pub fn new(config: &PresenceConfig, bus: EventBus) -> Self {
        let cache = Cache::builder()
            .max_capacity(100_000)
            .expire_after(PerEntryExpiry)
            .build();
        Self {
            cache,
            primary_ttl: Duration::from_secs(config.ttl_seconds),
            index_ttl: Duration::from_secs(config.ttl_seconds + config.index_grace_seconds),
            bus,
        }
    }

    /// Parameters describing the agent's current location; everything else in
    /// the record is derived here.
    pub async fn heartbeat(
        &self,
        workspace_id: &str,
        project_id: &str,
        repo: &str,
        branch: &str,
        alias: &str,
        role: &str,
        hostname: Option<&str>,
    ) {
        let record = PresenceRecord {
            workspace_id: workspace_id.to_string(),
            project_id: project_id.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            alias: alias.to_string(),
            role: role.to_string(),
            hostname: hostname.map(str::to_string),
            last_seen: Utc::now().to_rfc3339(),
        };

        self.cache
            .insert(
                primary_key(workspace_id),
                CacheEntry::Primary {
                    record: record.clone(),
                    ttl: self.primary_ttl,
                },
            )
            .await;

        for key in index_keys(&record) {
            self.add_to_index(key, workspace_id).await;
        }

        self.bus.publish(Event::now(
            project_id,
            workspace_id,
            EventKind::PresenceUpdated {
                alias: alias.to_string(),
                repo: repo.to_string(),
                branch: branch.to_string(),
            },
        ));
    }

    async fn add_to_index(&self, key: String, workspace_id: &str) {
        let mut members = match self.cache.get(&key).await {
            Some(CacheEntry::Index { members, .. }) => members,
            _ => BTreeSet::new(),
        };
        members.insert(workspace_id.to_string());
        self.cache
            .insert(
                key,
                CacheEntry::Index {
                    members,
                    ttl: self.index_ttl,
                },
            )
            .await;
    }

    /// Fetch live records matching the filter. Index members whose primary
    /// record has expired (or no longer matches the indexed dimension) are
    /// silently dropped.
    pub async fn lookup(&self, filter: &PresenceFilter) -> Vec<PresenceRecord> {
        let index_key = match (&filter.alias, &filter.repo, &filter.branch) {
            (Some(alias), _, _) => format!("idx:alias:{}:{}", filter.project_id, alias),
            (None, Some(repo), Some(branch)) => {
                format!("idx:branch:{}:{}:{}", filter.project_id, repo, branch)
            }
            (None, Some(repo), None) => format!("idx:repo:{}:{}", filter.project_id, repo),
            (None, None, _) => format!("idx:project:{}", filter.project_id),
        };

        let members = match self.cache.get(&index_key).await {
            Some(CacheEntry::Index { members, .. }) => members,
            _ => return Vec::new(),
        };

        let mut records = Vec::new();
        for workspace_id in members {
            let Some(CacheEntry::Primary { record, .. }) =
                self.cache.get(&primary_key(&workspace_id)).await
            else {
                continue; // stale index member
            };
            if record.project_id != filter.project_id {
                continue;
            }
            if let Some(repo) = &filter.repo {
                if &record.repo != repo {
                    continue;
                }
            }
            if let Some(branch) = &filter.branch {
                if &record.branch != branch {
                    continue;
                }
            }
            if let Some(alias) = &filter.alias {
                if &record.alias != alias {
                    continue;
                }
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.alias.cmp(&b.alias));
        records
    }

    pub async fn get(&self, workspace_id: &str) -> Option<PresenceRecord> {
        match self.cache.get(&primary_key(workspace_id)).await {
            Some(CacheEntry::Primary { record, .. }) => Some(record),
            _ => None,
        }
    }

    /// Drop a workspace's primary record immediately (workspace deletion).
    /// Index entries decay on their own TTL and are filtered meanwhile.
    pub async fn clear(&self, workspace_id: &str) {
        self.cache.invalidate(&primary_key(workspace_id)).await;
    }

    /// Flush moka's internal maintenance queue; tests use this to make
    /// expirations observable without waiting for background housekeeping.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

fn index_keys(record: &PresenceRecord) -> Vec<String> {
    vec![
        format!("idx:project:{}", record.project_id),
        format!("idx:repo:{}:{}", record.project_id, record.repo),
        format!(
            "idx:branch:{}:{}:{}",
            record.project_id, record.repo, record.branch
        ),
        format!("idx:alias:{}:{}", record.project_id, record.alias),
    ]
}
