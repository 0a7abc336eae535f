use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the beadhive server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BeadhiveConfig {
    /// HTTP listener settings
    pub server: ServerConfig,
    /// Relational store settings
    pub database: DatabaseConfig,
    /// Ephemeral presence cache settings
    pub presence: PresenceConfig,
    /// Trust boundary settings
    pub auth: AuthConfig,
    /// Notification outbox / background sweeper settings
    pub outbox: OutboxConfig,
    /// Escalation lifecycle settings
    pub escalations: EscalationConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Bootstrap (/v1/init) rate limit: requests per window per client IP
    pub init_rate_limit: u32,
    /// Bootstrap rate limit window in seconds
    pub init_rate_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite file path or sqlite:// URL
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresenceConfig {
    /// Primary presence record TTL in seconds (minimum 10)
    pub ttl_seconds: u64,
    /// Extra lifetime for secondary index entries beyond the primary TTL
    pub index_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared secret enabling proxy-mode signed headers; direct bearer mode
    /// is always available
    pub proxy_shared_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboxConfig {
    /// Sweeper wakeup interval in seconds
    pub drain_interval_seconds: u64,
    /// Entries claimed per drain pass
    pub drain_batch_size: u32,
    /// Delivery attempts before an entry is marked dead
    pub max_attempts: u32,
    /// Completed entries older than this many days are pruned
    pub retention_days: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EscalationConfig {
    /// Default expiry for escalations that don't specify one, in seconds
    pub default_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    pub log_json: bool,
}

impl Default for BeadhiveConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                init_rate_limit: 10,
                init_rate_window_seconds: 60,
            },
            database: DatabaseConfig {
                url: "beadhive.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            },
            presence: PresenceConfig {
                ttl_seconds: 1800,
                index_grace_seconds: 120,
            },
            auth: AuthConfig {
                proxy_shared_secret: None,
            },
            outbox: OutboxConfig {
                drain_interval_seconds: 5,
                drain_batch_size: 100,
                max_attempts: 3,
                retention_days: 7,
            },
            escalations: EscalationConfig {
                default_timeout_seconds: 3600,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_json: false,
            },
        }
    }
}

impl BeadhiveConfig {
    /// Load configuration with layered precedence:
    /// 1. Default values
    /// 2. beadhive.toml (if present)
    /// 3. Environment variables with BEADHIVE__ prefix (e.g. BEADHIVE__SERVER__PORT)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("beadhive.toml"))
    }

    pub fn load_from(config_file: &Path) -> Result<Self> {
        // Load .env if present; absence is fine
        let _ = dotenvy::dotenv();

        let mut builder =
            Config::builder().add_source(Config::try_from(&BeadhiveConfig::default())?);

        if config_file.exists() {
            builder = builder.add_source(File::from(config_file));
        }

        builder = builder.add_source(
            Environment::with_prefix("BEADHIVE")
                .separator("__")
                .try_parsing(true),
        );

        let config: BeadhiveConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be between 1 and 65535");
        }
        if self.presence.ttl_seconds < 10 {
            anyhow::bail!("presence.ttl_seconds must be at least 10");
        }
        if self.outbox.max_attempts == 0 {
            anyhow::bail!("outbox.max_attempts must be at least 1");
        }
        if self.database.url.trim().is_empty() {
            anyhow::bail!("database.url is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = BeadhiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.presence.ttl_seconds, 1800);
        assert_eq!(config.outbox.max_attempts, 3);
    }

    #[test]
    fn rejects_tiny_presence_ttl() {
        let mut config = BeadhiveConfig::default();
        config.presence.ttl_seconds = 5;
        assert!(config.validate().is_err());
    }
}
