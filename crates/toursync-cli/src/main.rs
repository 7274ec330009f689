use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use toursync_storage::{load_product_mappings_yaml, BookingStore, PgStore};
use toursync_sync::{Engine, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "toursync")]
#[command(about = "Tour booking reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every active product from upstream and refresh the booking cache.
    Sync,
    /// Print cache totals and per-product sync metadata.
    Health,
    /// Apply the embedded database migrations.
    Migrate,
    /// Upsert product mappings from a YAML file.
    ImportMappings {
        #[arg(default_value = "products.yaml")]
        path: PathBuf,
    },
    /// Run the HTTP server and, when enabled, the sync scheduler.
    Serve,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("TOURSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let engine = Engine::connect(config).await?;
            let report = engine.orchestrator.sync_all().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Health => {
            let engine = Engine::connect(config).await?;
            let report = engine.orchestrator.health().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::ImportMappings { path } => {
            let mappings = load_product_mappings_yaml(&path)?;
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            let imported = store
                .upsert_product_mappings(&mappings)
                .await
                .context("writing product mappings")?;
            println!("imported {imported} product mappings from {}", path.display());
        }
        Commands::Serve => {
            let engine = Engine::connect(config).await?;
            let scheduler = engine.maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(
                    cron_1 = engine.config.sync_cron_1.as_str(),
                    cron_2 = engine.config.sync_cron_2.as_str(),
                    "sync scheduler started"
                );
            }
            toursync_web::serve(&engine).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_has_help_text() {
        let cli = Cli::command();
        for sub in cli.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help text", sub.get_name());
        }
        assert!(cli.find_subcommand("import-mappings").is_some());
    }
}
