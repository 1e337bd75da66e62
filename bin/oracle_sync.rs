//! # Oracle Sync CLI
//!
//! Runs one synchronization pass, prints the stored checkpoints, or resets stored progress.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin oracle_sync -- sync
//! cargo run --bin oracle_sync -- status
//! cargo run --bin oracle_sync -- reset --entity 0x...
//! cargo run --bin oracle_sync -- --config other.toml sync
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use oracle_sync_sdk::{
    orchestrator::{SyncOrchestrator, SyncReport},
    progress_store::ProgressStore,
    settings::Settings,
    types::{conversions::string_to_address, EntityKind, Progress},
};

#[derive(Debug, Parser)]
#[command(about = "Incremental sync of oracle router and vault configuration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "Config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one synchronization pass
    Sync,
    /// Print stored checkpoints and entity counts
    Status,
    /// Reset all stored progress, or a single entity
    Reset {
        /// Only forget this entity
        #[arg(long)]
        entity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = Settings::from_path(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str()))
        .init();

    match cli.command {
        Command::Sync => sync(settings).await,
        Command::Status => {
            status(&settings);
            Ok(())
        }
        Command::Reset { entity } => reset(&settings, entity.as_deref()),
    }
}

async fn sync(settings: Settings) -> Result<()> {
    println!("🚀 {}", "Oracle sync".bold());
    println!("═══════════════════════════════════════════════════════════════════\n");

    let mut orchestrator = SyncOrchestrator::from_settings(settings).context("initializing sync")?;
    let report = orchestrator.run_once().await.context("sync run failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("Run {} at head {}", report.run_id, report.head);
    for source in &report.sources {
        println!(
            "  {} {:<24} [{}..{}] +{} deployments ({} cached)",
            "✓".green(),
            source.name,
            source.from_block,
            source.to_block,
            source.new_deployments,
            source.total_deployments
        );
    }
    for failure in &report.source_errors {
        println!("  {} {:<24} {}", "✗".red(), failure.name, failure.message);
    }

    let entities = &report.entities;
    println!(
        "\nEntities: {} processed, {} skipped, {} failed, {} events, {} reclassified, {} vaults attributed",
        entities.processed.to_string().green(),
        entities.skipped,
        if entities.failed.is_empty() {
            "0".normal()
        } else {
            entities.failed.len().to_string().red()
        },
        entities.events.total(),
        entities.reclassified,
        entities.vaults_attributed
    );
    for failure in &entities.failed {
        println!("  {} {:?}: {}", "✗".red(), failure.address, failure.message);
    }

    let elapsed = report.finished_at - report.started_at;
    if report.is_complete() {
        println!("\n{} in {}s", "Complete".green().bold(), elapsed.num_seconds());
    } else {
        println!(
            "\n{} in {}s ({} unresolved ranges, will retry next run)",
            "Incomplete".yellow().bold(),
            elapsed.num_seconds(),
            report.unresolved_ranges
        );
    }
}

fn status(settings: &Settings) {
    let mut store = ProgressStore::open_file(settings.progress_path());
    let progress = store.load();
    print_status(&progress);
}

fn print_status(progress: &Progress) {
    println!("{}", "Sources".bold());
    for (name, source) in &progress.sources {
        let checkpoint = source
            .last_synced_block
            .map(|b| b.to_string())
            .unwrap_or_else(|| "never".yellow().to_string());
        println!(
            "  {:<24} {:<6} checkpoint {:<12} {} deployments, {} gaps",
            name,
            source.kind.as_str(),
            checkpoint,
            source.deployments.len(),
            source.unresolved_ranges.len()
        );
    }

    let count = |kind: EntityKind| progress.entities.values().filter(|e| e.kind == kind).count();
    let never = progress
        .entities
        .values()
        .filter(|e| e.last_processed_block.is_none())
        .count();
    let errored = progress
        .entities
        .values()
        .filter(|e| e.last_error.is_some())
        .count();
    println!(
        "\n{} {} routers, {} vaults ({} never processed, {} with errors)",
        "Entities".bold(),
        count(EntityKind::Router),
        count(EntityKind::Vault),
        never,
        if errored == 0 {
            "0".normal()
        } else {
            errored.to_string().red()
        }
    );
    println!("Unresolved ranges: {}", progress.unresolved_range_count());
}

fn reset(settings: &Settings, entity: Option<&str>) -> Result<()> {
    let mut store = ProgressStore::open_file(settings.progress_path());
    match entity {
        Some(raw) => {
            let address = string_to_address(raw).with_context(|| format!("invalid entity address {}", raw))?;
            let mut progress = store.load();
            match store.reset_entity(&mut progress, &address)? {
                Some(_) => println!("{} {:?}", "Reset".green(), address),
                None => println!("{} {:?} is not tracked", "Nothing to reset:".yellow(), address),
            }
        }
        None => {
            store.reset()?;
            println!("{} {}", "Reset".green(), store.key());
        }
    }
    Ok(())
}
