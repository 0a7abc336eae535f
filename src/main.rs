use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use beadhive::config::BeadhiveConfig;
use beadhive::db::Database;
use beadhive::identity::EmbeddedIdentity;
use beadhive::telemetry::init_telemetry;

#[derive(Parser)]
#[command(name = "beadhive")]
#[command(about = "Coordination server for multi-agent development")]
#[command(
    long_about = "Beadhive arbitrates which agent works on what: it mirrors client-pushed \
                  work items, enforces at-most-one active claim per item, versions project \
                  policy, and delivers notifications reliably. Start it with 'beadhive serve'."
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "beadhive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Override the bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run pending database migrations and exit
    Migrate,
    /// Verify configuration, database connectivity, and the embedded policy
    /// defaults, then exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = BeadhiveConfig::load_from(&cli.config)?;
    init_telemetry(&config.observability)?;

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            let db = Database::connect(&config.database).await?;
            beadhive::server::serve(config, db, Arc::new(EmbeddedIdentity::new())).await
        }
        Commands::Migrate => {
            let db = Database::connect(&config.database).await?;
            db.migrate().await?;
            println!("migrations up to date");
            Ok(())
        }
        Commands::Check => {
            let db = Database::connect_ephemeral().await?;
            db.health_check().await?;
            let bundle = beadhive::policies::default_bundle();
            println!(
                "ok: config valid, database reachable, default bundle has {} invariants / {} roles",
                bundle.invariants.len(),
                bundle.roles.len()
            );
            Ok(())
        }
    }
}
