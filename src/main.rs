use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally::clock::{Clock, SystemClock};
use tally::config::TallyConfig;
use tally::metrics::MetricsRegistry;
use tally::ratelimit::{
    CounterStore, Limiter, LimiterOptions, MemoryCounterStore, PgCounterStore, Rate,
};

/// Exit code for a check that was denied.
const EXIT_DENIED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Persistent sliding-window rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Keep counters in process memory instead of PostgreSQL
    #[arg(long, global = true)]
    memory: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count hits against a key and print the decision
    Check {
        /// The rate limit key
        key: String,

        /// Maximum hits per window (defaults to the configured limit)
        #[arg(long)]
        limit: Option<u64>,

        /// Window length in seconds (defaults to the configured window)
        #[arg(long)]
        window_secs: Option<u64>,

        /// Number of hits to count
        #[arg(short, long, default_value_t = 1)]
        n: u64,

        /// Print the metrics collected during the check
        #[arg(long)]
        metrics: bool,
    },

    /// Delete counter rows older than the given age
    Cleanup {
        /// Age in seconds; defaults to twice the cleanup interval
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Run the periodic cleanup loop until interrupted
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TallyConfig::load(cli.config.as_deref()).context("cannot load configuration")?;
    init_tracing(&config, cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tally");

    let store: Arc<dyn CounterStore> = if cli.memory {
        info!("Using in-memory counter store");
        Arc::new(MemoryCounterStore::new())
    } else {
        Arc::new(
            PgCounterStore::connect(&config.database)
                .await
                .context("cannot open counter store")?,
        )
    };

    let registry = Arc::new(MetricsRegistry::new());
    let options = LimiterOptions::default()
        .with_cleanup_interval(config.rate_limiting.cleanup_interval())
        .with_registry(registry.clone());
    let limiter = Limiter::with_options(store, options)
        .await
        .context("cannot create rate limiter")?;

    match cli.command {
        Command::Check {
            key,
            limit,
            window_secs,
            n,
            metrics,
        } => {
            let default_rate = config.rate_limiting.default_rate();
            let rate = Rate::new(
                limit.unwrap_or(default_rate.limit),
                window_secs.map(Duration::from_secs).unwrap_or(default_rate.window),
            );

            let result = limiter.allow_n(&key, rate, n).await?;
            let now = SystemClock::new().now();

            println!("{}", serde_json::to_string_pretty(&result)?);
            for (name, value) in result.headers(now) {
                println!("{}: {}", name, value);
            }
            if metrics {
                print!("{}", registry.render_text());
            }

            if !result.allowed {
                std::process::exit(EXIT_DENIED);
            }
        }
        Command::Cleanup { older_than_secs } => {
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| limiter.cleanup_interval().saturating_mul(2));

            let rows = limiter.cleanup(older_than).await?;
            println!("{}", rows);
        }
        Command::Run => {
            limiter.start_cleanup(shutdown_signal());
            limiter.wait_cleanup_stopped().await;
            info!("Tally stopped");
        }
    }

    Ok(())
}

fn init_tracing(config: &TallyConfig, json_flag: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json_flag || config.logging.json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
