use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hush::{Config, QueryType, Service};

#[derive(Parser)]
#[command(name = "hush")]
#[command(about = "Private blocklist matching and encrypted DNS resolution", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "hush.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load sources and keep them refreshed, logging stats periodically
    Run,
    /// Load sources and check whether a domain is blocked
    Check {
        domain: String,
        #[arg(short = 't', long, default_value = "A")]
        qtype: QueryType,
    },
    /// Load sources and resolve a domain through the encrypted upstreams
    Resolve {
        domain: String,
        #[arg(short = 't', long, default_value = "A")]
        qtype: QueryType,
        /// Deadline in milliseconds
        #[arg(short, long)]
        deadline: Option<u64>,
    },
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn run(service: Arc<Service>) -> anyhow::Result<()> {
    let _background = service.spawn_background();
    let interval = Duration::from_secs(service.config().resolver.stats_interval_secs.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = service.take_stats();
                let health = service.stats();
                info!(
                    lookups = stats.lookups,
                    blocked = stats.blocked,
                    cache_hits = stats.cache_hits,
                    cache_misses = stats.cache_misses,
                    evictions = stats.cache_evictions,
                    upstream_errors = stats.upstream_errors,
                    upstream_avg_ms = stats.upstream.avg_ms(),
                    blocklist_entries = health.blocklist_entries,
                    cache_entries = health.cache_entries,
                    "stats"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    let service = Arc::new(Service::new(config)?);

    let reports = service.refresh().await;
    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    info!(sources = reports.len(), failed, "initial load finished");

    match args.command {
        Command::Run => run(service).await,
        Command::Check { domain, qtype } => {
            let result = service.check(&domain, qtype);
            match (result.blocked, result.category) {
                (true, Some(category)) => println!("blocked ({category}, {:?})", result.matched_by),
                (true, None) => println!("blocked ({:?})", result.matched_by),
                (false, _) => println!("allowed"),
            }
            Ok(())
        }
        Command::Resolve {
            domain,
            qtype,
            deadline,
        } => {
            let resolution = service.resolve(&domain, qtype, deadline).await;
            if resolution.blocked {
                println!("blocked");
                return Ok(());
            }
            let resolution = resolution.into_result()?;
            let bytes = resolution.response.map(|r| r.len()).unwrap_or(0);
            let source = if resolution.cached { "cache" } else { "upstream" };
            println!("resolved: {bytes} bytes from {source}");
            Ok(())
        }
    }
}
