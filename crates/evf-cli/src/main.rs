use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evf_core::Category;
use evf_sync::{LoadError, LoadReport, SyncConfig, SyncService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evf-cli")]
#[command(about = "Load opportunity fixtures into the document store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP trigger routes.
    Serve,
    /// Load one category fixture.
    Sync { category: Category },
    /// Load every category fixture in turn.
    SyncAll,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// One line per category: human-readable, or the serialized report when
/// JSON logging is on.
fn print_outcome(category: Category, result: &Result<LoadReport, LoadError>, json: bool) {
    match result {
        Ok(report) if json => match serde_json::to_string(report) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("{category}: report not serializable: {err}"),
        },
        Ok(report) => println!(
            "{category}: parsed={} written={} skipped={} path={} sha256={}",
            report.parsed,
            report.written,
            report.skipped.len(),
            report.path,
            report.fixture_sha256
        ),
        Err(err) if json => println!(
            "{}",
            serde_json::json!({
                "category": category,
                "error": err.to_string(),
                "kind": err.kind(),
            })
        ),
        Err(err) => println!("{category}: failed ({}): {err}", err.kind()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_tracing(config.log_json);

    let store = config.open_store().context("opening document store")?;
    let service = SyncService::new(config.resources_dir.clone(), store);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => evf_web::serve(config.web_port, service).await?,
        Commands::Sync { category } => {
            let result = service.sync(category).await;
            print_outcome(category, &result, config.log_json);
            result?;
        }
        Commands::SyncAll => {
            let results = service.sync_all().await;
            let mut failed = 0usize;
            for (category, result) in &results {
                print_outcome(*category, result, config.log_json);
                if result.is_err() {
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{failed} of {} categories failed to load", results.len());
            }
        }
    }

    Ok(())
}
