// ABOUTME: Entry point for the courtyard persistence CLI.
// ABOUTME: Parses arguments, initializes tracing, builds the store, and runs a collaborator.

mod config;
mod stress;
mod verify;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use courtyard_store::{LocalStore, MemorySubstrate, SqliteSubstrate, StoreConfig, Substrate};

use crate::config::{CourtyardConfig, SubstrateKind};

#[derive(Parser)]
#[command(
    name = "courtyard",
    version,
    about = "Versioned, expiring key-value persistence for the Courtyard app"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run black-box verification checks against the store facade
    Verify,
    /// Fill the origin near capacity with expired filler, then exercise a normal write
    Stress,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courtyard=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = CourtyardConfig::from_env()?;
    tracing::info!(
        prefix = %config.prefix,
        capacity = config.capacity_bytes,
        substrate = ?config.substrate,
        "courtyard starting up"
    );

    let (store, substrate) = build_store(&config)?;
    store.init();

    let ok = match cli.command {
        Commands::Verify => {
            let report = verify::run(&store).await;
            report.print();
            report.all_passed()
        }
        Commands::Stress => {
            let outcome = stress::run(&store, &substrate, &config.prefix).await;
            outcome.print();
            outcome.passed
        }
    };

    store.dispose();
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Construct the substrate named by the config and a store on top of it.
/// The substrate handle is returned alongside so collaborators that work
/// beneath the facade (the stress driver) can reach it.
fn build_store(config: &CourtyardConfig) -> anyhow::Result<(LocalStore, Arc<dyn Substrate>)> {
    let substrate: Arc<dyn Substrate> = match config.substrate {
        SubstrateKind::Memory => Arc::new(MemorySubstrate::with_capacity(config.capacity_bytes)),
        SubstrateKind::Sqlite => {
            if let Some(parent) = config.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(SqliteSubstrate::open_with_capacity(
                &config.db_path,
                config.capacity_bytes,
            )?)
        }
    };

    let store = LocalStore::new(
        Arc::clone(&substrate),
        StoreConfig {
            prefix: config.prefix.clone(),
            capacity_bytes: config.capacity_bytes,
            ..StoreConfig::default()
        },
    );
    Ok((store, substrate))
}
