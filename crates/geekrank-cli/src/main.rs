use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use geekrank_catalog::{load_ranked_rows, write_sorted_view};
use geekrank_core::ranked_ids;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "geekrank")]
#[command(about = "Board game rank reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the ranked dataset against the store (default).
    Sync,
    /// Apply pending database migrations.
    Migrate,
    /// Sort the dataset and write the ordered identifier view only.
    Sort {
        #[arg(long, default_value = "sorted_view.csv")]
        output: PathBuf,
    },
}

fn print_progress(current: usize, total: usize) {
    const BAR_LENGTH: usize = 50;
    if total == 0 {
        return;
    }
    let filled = current * BAR_LENGTH / total;
    let bar: String = "#".repeat(filled) + &"-".repeat(BAR_LENGTH - filled);
    let percentage = current as f64 * 100.0 / total as f64;
    print!("\r[{bar}] {percentage:.2}%");
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = geekrank_sync::pipeline_from_env()
                .await?
                .with_progress(Box::new(print_progress));
            let summary = pipeline.run_once().await?;
            println!();
            println!("run {} finished", summary.run_id);
            println!("games ranked:     {}", summary.outcome.ranked);
            println!("new games added:  {}", summary.outcome.new_games);
            println!("games refreshed:  {}", summary.outcome.refreshed);
            println!("games purged:     {}", summary.outcome.purged);
            println!(
                "unreachable ids:  {} (malformed: {}, missing name: {})",
                summary.outcome.unavailable_ids.len(),
                summary.outcome.malformed_ids.len(),
                summary.outcome.unnamed_ids.len()
            );
        }
        Commands::Migrate => {
            geekrank_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Sort { output } => {
            let config = geekrank_sync::SyncConfig::from_env();
            let mut rows = load_ranked_rows(&config.dataset_path)?;
            let ids = ranked_ids(&mut rows);
            write_sorted_view(&output, &ids)?;
            println!("wrote {} identifiers to {}", ids.len(), output.display());
        }
    }

    Ok(())
}
