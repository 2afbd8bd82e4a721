use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use refwatch_core::{Config, Services};
use refwatch_store::ServiceRequestRecord;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "refwatch")]
#[command(version, about = "Watches the referral inbox and notifies on new referrals", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true, env = "REFWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Poll until interrupted (default)
    Run,
    /// Run a single poll cycle and exit
    Once,
    /// Send a sample notification on every configured channel
    TestNotifications,
    /// Show what the store knows
    Status,
    /// Write a config file with defaults
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets usually live in .env next to the binary
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.config).await,
        Commands::Once => once(cli.config).await,
        Commands::TestNotifications => test_notifications(cli.config).await,
        Commands::Status => status(cli.config),
        Commands::InitConfig { force } => init_config(cli.config, force),
    }
}

fn init_logging(json: bool) {
    // Initialize logging - helps when things go sideways
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refwatch=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn open_services(path: Option<PathBuf>) -> anyhow::Result<Services> {
    let config = Config::load(path.as_deref()).context("failed to load config")?;
    Services::open(config).context("failed to start")
}

async fn run(path: Option<PathBuf>) -> anyhow::Result<()> {
    let services = open_services(path)?;
    let poll = services.poll_loop()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

    poll.run(shutdown_rx).await;
    poll.coordinator().close().await;
    Ok(())
}

/// Flip `shutdown` once `signal` fires.
///
/// The poller reads a dropped sender as a stop request, so when the signal
/// cannot be listened for the sender is held until the process exits.
async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("received Ctrl+C, stopping after the current cycle");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C, polling continues");
            std::future::pending::<()>().await;
        }
    }
}

async fn once(path: Option<PathBuf>) -> anyhow::Result<()> {
    let services = open_services(path)?;
    let poll = services.poll_loop()?;

    let result = poll.run_cycle().await;
    poll.coordinator().close().await;
    let report = result?;

    println!(
        "fetched {} of {} upstream, {} new, {} marked notified",
        report.fetched, report.total_upstream, report.new_records, report.marked
    );
    Ok(())
}

async fn test_notifications(path: Option<PathBuf>) -> anyhow::Result<()> {
    let services = open_services(path)?;

    if let Some(smtp) = services.smtp_transport()? {
        smtp.verify().await.context("SMTP connection check failed")?;
        println!("SMTP connection OK");
    }

    let coordinator = services.coordinator()?;
    if coordinator.channels().is_empty() {
        anyhow::bail!(
            "no notification channels configured; set EMAILS_TO_NOTIFY or PHONE_NUMBERS_TO_NOTIFY"
        );
    }

    let sample = ServiceRequestRecord::new(
        format!("test-{}", Utc::now().timestamp()),
        "Test Patient",
    );
    let outcomes = coordinator.broadcast(std::slice::from_ref(&sample)).await;
    coordinator.close().await;

    let mut failures = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(delivery) => {
                println!("{}: sent to {}", outcome.channel, delivery.sent.join(", "));
                for (recipient, reason) in &delivery.failed {
                    failures += 1;
                    println!("{}: FAILED {} ({})", outcome.channel, recipient, reason);
                }
            }
            Err(e) => {
                failures += 1;
                println!("{}: FAILED ({})", outcome.channel, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} notification(s) failed", failures);
    }
    Ok(())
}

fn status(path: Option<PathBuf>) -> anyhow::Result<()> {
    let services = open_services(path)?;
    let report = services.status()?;

    println!("Stored referrals: {}", report.records);
    match &report.metadata {
        Some(meta) => println!(
            "Upstream total:   {} (as of {})",
            meta.total_records_seen_upstream, meta.updated_at
        ),
        None => println!("Upstream total:   never fetched"),
    }
    match &report.last_notified {
        Some(record) => println!(
            "Last notified:    {} {} at {}",
            record.id,
            record.patient_name,
            record
                .notified_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        ),
        None => println!("Last notified:    none"),
    }
    match report.session_expires_at {
        Some(at) => println!("Session valid until {}", at),
        None => println!("No valid session; next poll signs in"),
    }

    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = match path {
        Some(p) => p,
        None => Config::default_path()?,
    };

    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default().save(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
