//! stationflow CLI
//!
//! Runs the ingestion daemon and one-shot maintenance commands.

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stationflow::config::{generate_default_config, Config, LoggingConfig};
use stationflow::coordinator::{JobStatus, Priority};
use stationflow::service::Service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stationflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Station measurement ingestion, aggregation and caching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until Ctrl-C or SIGTERM
    Run,

    /// Import one file and wait for the result
    Import {
        /// Station the file belongs to
        station: String,
        /// Path to the measurement file
        path: PathBuf,
        /// low, normal, high or urgent
        #[arg(short, long, default_value = "high")]
        priority: Priority,
    },

    /// Recompute rollups over their trailing windows
    Aggregate,

    /// Apply retention, compaction and planner statistics
    Maintain,

    /// Show the status of a running daemon
    Status {
        /// Status API URL
        #[arg(long, default_value = "http://127.0.0.1:8085")]
        url: String,
    },

    /// Print a commented default config
    InitConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Config written to {}", path.display());
                }
                None => print!("{}", content),
            }
            Ok(())
        }
        Commands::Status { url } => status(&url).await,
        command => {
            let config = match &cli.config {
                Some(path) => Config::load_with_env(path)?,
                None => Config::load_default()?,
            };
            init_logging(&config.logging);
            config.validate()?;

            let service = Service::build(config)?;
            match command {
                Commands::Run => run(service).await,
                Commands::Import {
                    station,
                    path,
                    priority,
                } => import(service, &station, path, priority).await,
                Commands::Aggregate => aggregate(service).await,
                Commands::Maintain => maintain(service).await,
                Commands::Status { .. } | Commands::InitConfig { .. } => Ok(()),
            }
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stationflow={}", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(service: Service) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "stationflow starting");
    service.start();
    stationflow::api::shutdown_signal().await;
    service.stop().await;
    tracing::info!("stationflow shutdown complete");
    Ok(())
}

async fn import(
    service: Service,
    station: &str,
    path: PathBuf,
    priority: Priority,
) -> anyhow::Result<()> {
    let coordinator = service.coordinator();
    let id = coordinator.submit(station, &path, priority)?;
    coordinator.start();
    let job = coordinator.wait(id).await;
    coordinator.stop().await;
    let job = job?;

    match (job.status, job.outcome) {
        (JobStatus::Completed, Some(outcome)) => {
            println!(
                "{}: {} inserted, {} skipped, {} errors (lines {}..{}, {} ms)",
                outcome.file,
                outcome.inserted,
                outcome.skipped,
                outcome.errors,
                outcome.start_line,
                outcome.end_line,
                outcome.duration_ms
            );
            Ok(())
        }
        (status, _) => bail!(
            "import of {} ended {}: {}",
            path.display(),
            status,
            job.error.unwrap_or_default()
        ),
    }
}

async fn aggregate(service: Service) -> anyhow::Result<()> {
    let engine = std::sync::Arc::clone(service.engine());
    let report = tokio::task::spawn_blocking(move || engine.refresh(Local::now().naive_local()))
        .await??;
    for (granularity, buckets) in &report.buckets {
        println!("{:<8} {} buckets", granularity.to_string(), buckets);
    }
    println!(
        "{} rows scanned across {} stations",
        report.rows_scanned,
        report.stations.len()
    );
    Ok(())
}

async fn maintain(service: Service) -> anyhow::Result<()> {
    let engine = std::sync::Arc::clone(service.engine());
    let report =
        tokio::task::spawn_blocking(move || engine.maintain(Local::now().naive_local())).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.has_failures() {
        bail!("maintenance finished with failures");
    }
    Ok(())
}

async fn status(url: &str) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{}/status", url.trim_end_matches('/')))
        .send()
        .await
        .with_context(|| format!("cannot reach stationflow at {}", url))?;

    if !response.status().is_success() {
        bail!("status API returned {}", response.status());
    }

    let status: serde_json::Value = response.json().await?;
    let coordinator = &status["coordinator"];

    println!("stationflow v{}", status["version"].as_str().unwrap_or("?"));
    println!();
    println!(
        "Coordinator: {} ({} active / {} max, {} queued)",
        if coordinator["paused"].as_bool().unwrap_or(false) {
            "paused"
        } else if coordinator["running"].as_bool().unwrap_or(false) {
            "running"
        } else {
            "stopped"
        },
        coordinator["active"].as_array().map(|a| a.len()).unwrap_or(0),
        coordinator["max_concurrent"],
        coordinator["queue_depth"],
    );
    if let Some(file) = coordinator["last_file_processed"].as_str() {
        println!("Last file:   {}", file);
    }

    if let Some(jobs) = status["scheduler"].as_object() {
        println!();
        println!("{:<14} {:>6} {:>6} {:>6} {:>6}", "Job", "Runs", "OK", "Fail", "Skip");
        println!("{}", "-".repeat(44));
        for (name, stats) in jobs {
            println!(
                "{:<14} {:>6} {:>6} {:>6} {:>6}",
                name, stats["runs"], stats["successes"], stats["failures"], stats["skipped"]
            );
        }
    }

    if let Some(uptime) = status["uptime_seconds"].as_u64() {
        println!();
        println!("Uptime: {}", format_duration(uptime));
    }
    Ok(())
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let minutes = (secs % 3600) / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}
