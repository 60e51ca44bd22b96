mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pcdc_sync::{CycleOutcome, ExtractorConfig};

#[derive(Debug, Parser)]
#[command(name = "pcdc-cli")]
#[command(about = "Incremental profile extractor")]
struct Cli {
    /// Dotenv file to load instead of searching for `.env`.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll continuously until Ctrl-C.
    Extract,
    /// Run a single poll-process-flush cycle.
    Once,
    /// Create the profile tables and seed the watermark.
    Migrate,
    /// Run one cycle over a JSON fixture into a file sink.
    Replay {
        #[arg(long)]
        fixture: PathBuf,
        #[arg(long, default_value = "profiles.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_file = pcdc_sync::load_env_file(cli.env_file.as_deref())?;
    let config = ExtractorConfig::from_env();
    logging::init(&config.log_level);
    if let Some(path) = env_file {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    match cli.command.unwrap_or(Commands::Extract) {
        Commands::Extract => {
            let cancel = pcdc_sync::cancel_on_ctrl_c();
            let summary = pcdc_sync::run_extract_from_env(cancel).await?;
            println!(
                "extract stopped: cycles={} batches={} records={} watermark={}",
                summary.cycles,
                summary.batches,
                summary.records,
                summary
                    .watermark
                    .map(|w| w.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Commands::Once => match pcdc_sync::run_once_from_env().await? {
            Some(outcome) => print_outcome(&outcome),
            None => println!("once: stopped before polling"),
        },
        Commands::Migrate => {
            let report = pcdc_sync::migrate_from_env().await?;
            println!(
                "migrate complete: tables={} watermark_seeded={}",
                report.tables, report.watermark_seeded
            );
        }
        Commands::Replay { fixture, output } => {
            let outcome = pcdc_sync::replay_fixture(&fixture, &output).await?;
            if let Some(outcome) = &outcome {
                print_outcome(outcome);
            }
            let batches = pcdc_storage::load_file_batches(&output).await?;
            println!(
                "replay output: path={} batches_in_file={}",
                output.display(),
                batches.len()
            );
        }
    }

    Ok(())
}

fn print_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Empty { watermark } => {
            println!("cycle complete: records=0 watermark={watermark}")
        }
        CycleOutcome::Flushed(report) => println!(
            "cycle complete: run_id={} records={} batch_digest={} watermark={}",
            report.run_id, report.records, report.batch_digest, report.watermark
        ),
        CycleOutcome::Cancelled {
            watermark,
            flushed,
            dropped,
        } => println!(
            "cycle interrupted: flushed={flushed} dropped={dropped} watermark={watermark}"
        ),
    }
}
