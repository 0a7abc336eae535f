use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::config::DatabaseConfig;

/// Shared database handle for the coordination engine.
///
/// One SQLite database, one pool, three logical partitions: coordination
/// tables, work-item tables, and the identity tables owned by the embedded
/// identity accessor. Coordination code never queries the identity partition
/// directly; it goes through the `IdentityAccess` trait.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and optionally migrate the database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = normalize_url(&config.url);

        if !sqlx::Sqlite::database_exists(&url).await? {
            info!(url = %url, "creating database");
            sqlx::Sqlite::create_database(&url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&url)
            .await?;

        // WAL keeps readers unblocked while a sync transaction writes
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

        let db = Self { pool };
        if config.auto_migrate {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// In-memory database for tests and `check`.
    pub async fn connect_ephemeral() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations completed");
        Ok(())
    }

    /// Pool accessor for queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn normalize_url(url: &str) -> String {
    if url.starts_with("sqlite:") {
        url.to_string()
    } else {
        format!("sqlite://{url}")
    }
}
