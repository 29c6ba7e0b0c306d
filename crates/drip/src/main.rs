//! Drip: send scheduling for donor CRM email campaigns.
//!
//! Main binary with subcommands:
//! - `daemon`: HTTP API plus the dispatch loop
//! - `status`: print a campaign's status aggregate

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;

#[derive(Parser)]
#[command(name = "drip")]
#[command(about = "Email send scheduling engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling daemon (HTTP API + dispatch loop)
    Daemon {
        /// SQLite database path
        #[arg(long, env = "DRIP_DB", default_value = "drip.db")]
        db: String,

        /// Address for the HTTP API
        #[arg(long, env = "DRIP_BIND", default_value = "0.0.0.0:8080")]
        bind: String,

        /// Base URL of the CRM internal API
        #[arg(long, env = "DRIP_CRM_URL")]
        crm_url: String,

        /// Fallback timezone for organizations the CRM has no zone recorded for
        #[arg(long, env = "DRIP_DEFAULT_TIMEZONE", default_value = "America/New_York")]
        default_timezone: String,

        /// Seconds between dispatch sweeps
        #[arg(long, env = "DRIP_SWEEP_INTERVAL", default_value = "30")]
        sweep_interval: u64,

        /// Seconds before an in-flight send attempt is abandoned
        #[arg(long, env = "DRIP_TRANSPORT_TIMEOUT", default_value = "30")]
        transport_timeout: u64,

        /// Attempts before a failed send stops being retryable
        #[arg(long, env = "DRIP_MAX_ATTEMPTS", default_value = "3")]
        max_attempts: u32,

        /// Jobs claimed per sweep
        #[arg(long, env = "DRIP_BATCH_SIZE", default_value = "50")]
        batch_size: u32,
    },

    /// Print a campaign's status aggregate as JSON
    Status {
        /// SQLite database path
        #[arg(long, env = "DRIP_DB", default_value = "drip.db")]
        db: String,

        /// Campaign to inspect
        #[arg(long)]
        campaign: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "drip=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            db,
            bind,
            crm_url,
            default_timezone,
            sweep_interval,
            transport_timeout,
            max_attempts,
            batch_size,
        } => {
            daemon::run(daemon::DaemonConfig {
                db,
                bind,
                crm_url,
                default_timezone,
                sweep_interval,
                transport_timeout,
                max_attempts,
                batch_size,
            })
            .await
        }

        Commands::Status { db, campaign } => print_status(&db, &campaign).await,
    }
}

async fn print_status(db: &str, campaign: &str) -> Result<()> {
    use drip_engine::DEFAULT_MAX_ATTEMPTS;
    use drip_store::JobStore;

    let store = JobStore::open(db)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let status = store
        .status_counts(campaign, DEFAULT_MAX_ATTEMPTS)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let rendered =
        serde_json::to_string_pretty(&status).map_err(|e| miette::miette!("{}", e))?;
    println!("{rendered}");
    Ok(())
}
