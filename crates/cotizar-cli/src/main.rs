use std::path::PathBuf;

use anyhow::Result;
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use cotizar_sync::{SeriesReport, SyncAttempt, SyncConfig, SyncOutcome};
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "cotizar")]
#[command(about = "Keeps a workbook of Argentine exchange rates, indices and grain board prices up to date")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every series if the last run is more than a day old.
    Sync {
        /// Run even if the last run is recent.
        #[arg(long)]
        force: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show the destination and when the last run happened.
    Status,
    /// Create the destination workbook and remember its path.
    Init { path: PathBuf },
    /// Forget the remembered destination.
    Reset,
}

fn init_tracing() {
    let level = std::env::var("COTIZAR_LOG")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn describe(report: &SeriesReport) -> String {
    match &report.outcome {
        SyncOutcome::UpToDate => "up to date".to_string(),
        SyncOutcome::NoNewRecords => "no new records".to_string(),
        SyncOutcome::Updated { fetched, stored } => format!("{fetched} fetched, {stored} stored"),
        SyncOutcome::Reconciled { filled, write } => format!("{filled} gaps filled ({write:?})"),
        SyncOutcome::SourceFailed { kind, message } | SyncOutcome::WriteFailed { kind, message } => {
            format!("{kind}: {message}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        force: false,
        json: false,
    }) {
        Commands::Sync { force, json } => {
            let summary = match cotizar_sync::run_sync_once_from_env(force).await? {
                SyncAttempt::Completed(summary) => summary,
                attempt @ SyncAttempt::NotDue { .. } if json => {
                    println!("{}", serde_json::to_string_pretty(&attempt)?);
                    return Ok(());
                }
                SyncAttempt::NotDue { last_run } => {
                    println!(
                        "last run completed at {}; use --force to sync anyway",
                        last_run.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
                    );
                    return Ok(());
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            for report in &summary.series {
                println!("{:<16} {}", report.series.sheet_name(), describe(report));
            }
            for report in &summary.reconciled {
                println!("{:<16} {}", format!("{} (gaps)", report.series), describe(report));
            }
            println!(
                "sync complete: run_id={} failures={}",
                summary.run_id,
                summary.failures()
            );
        }
        Commands::Status => {
            let config = SyncConfig::from_env();
            let status = cotizar_sync::run_status(&config, Utc::now())?;
            println!("config:      {}", status.config_path.display());
            match &status.destination {
                Some(path) => println!("destination: {}", path.display()),
                None => println!("destination: (not set; run `cotizar init <path>`)"),
            }
            match status.last_run {
                Some(ts) => println!("last run:    {}", ts.to_rfc3339()),
                None => println!("last run:    never"),
            }
            println!("due:         {}", if status.due { "yes" } else { "no" });
        }
        Commands::Init { path } => {
            let config = SyncConfig::from_env();
            let created = cotizar_sync::init_destination(&config, &path).await?;
            println!(
                "destination {} ready ({} sheets created)",
                path.display(),
                created.len()
            );
        }
        Commands::Reset => {
            let config = SyncConfig::from_env();
            match cotizar_sync::clear_destination(&config)? {
                Some(path) => println!("destination {} forgotten", path.display()),
                None => println!("no destination was set"),
            }
        }
    }

    Ok(())
}
