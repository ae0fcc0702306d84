use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use csync_feed::inspect_columns;
use csync_sync::logging::LogSinks;
use csync_sync::{detect_candidates, report_markdown, RunOutcome, SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "csync-cli")]
#[command(about = "Centris listing feed sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass (default).
    Sync,
    /// List the newest source files matching the configured pattern.
    Detect,
    /// Print the columns of the first non-empty line of a data file.
    Inspect { path: PathBuf },
    /// Render the latest run summary as markdown.
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let logs = LogSinks::new(&config.logs_dir())?;
    logs.install(true)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?.with_log_sinks(logs);
            match pipeline.run_once().await? {
                RunOutcome::Skipped => println!("sync skipped: another run holds the lock"),
                RunOutcome::Completed(summary) => {
                    let c = summary.changes_tracked;
                    println!(
                        "sync complete: created={} updated={} unchanged={} reactivated={} unpublished={} expired={} duration={:.2}s",
                        c.created,
                        c.updated,
                        c.unchanged,
                        c.reactivated,
                        c.unpublished,
                        c.expired,
                        summary.duration.unwrap_or_default()
                    );
                }
            }
        }
        Commands::Detect => {
            let candidates = tokio::task::spawn_blocking(move || detect_candidates(&config))
                .await
                .context("joining detection task")?;
            if candidates.is_empty() {
                println!("no matching source files");
            }
            for c in candidates {
                println!(
                    "{}\t{}\t{}\t{}",
                    c.path.display(),
                    c.size_display,
                    c.mtime_display,
                    c.matched_rule
                );
            }
        }
        Commands::Inspect { path } => {
            let columns = inspect_columns(&path)
                .with_context(|| format!("inspecting {}", path.display()))?;
            if columns.is_empty() {
                println!("{} has no data lines", path.display());
            }
            for (index, value) in columns {
                println!("[{index}] => {value}");
            }
        }
        Commands::Report => {
            print!("{}", report_markdown(&config.reports_dir()).await?);
        }
    }

    Ok(())
}
