//! multipost-worker - Background daemon for the publish pipeline
//!
//! Hosts the per-platform worker pools, recovers interrupted targets at
//! startup, and ticks the token-refresh and retention sweeps.

use clap::Parser;
use libmultipost::config::Config;
use libmultipost::credentials::CredentialStore;
use libmultipost::db::Database;
use libmultipost::error::Result;
use libmultipost::logging::{LogFormat, LoggingConfig};
use libmultipost::platforms::create_adapters;
use libmultipost::refresh::{retention_sweep, RefreshSweep};
use libmultipost::target::RetryPolicy;
use libmultipost::types::{Target, TargetState};
use libmultipost::worker::{build_queues, ClaimMessage, PublishContext, QueueSet, WorkerPool};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "multipost-worker")]
#[command(version)]
#[command(about = "Background daemon for publishing posts to linked platforms")]
#[command(long_about = "\
multipost-worker - Background daemon for the publish pipeline

DESCRIPTION:
    multipost-worker runs one worker pool per platform, consuming queued
    publish targets, claiming them atomically, and driving each through
    the retry state machine. It also refreshes expiring platform tokens
    and prunes old audit entries on a periodic sweep.

USAGE:
    # Run in foreground (logs to stderr)
    multipost-worker

    # Custom poll and sweep intervals
    multipost-worker --poll-interval 30 --sweep-interval 1800

    # Enable verbose logging
    multipost-worker --verbose

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes in-flight attempts)

CONFIGURATION:
    Configuration file: ~/.config/multipost/config.toml
    (override with --config or MULTIPOST_CONFIG)

    The credential master key must be set via [encryption] master_key
    or the MULTIPOST_MASTER_KEY environment variable; the daemon refuses
    to start without it.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Credential error
    3 - Invalid input
")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seconds between queue maintenance polls (default: 60)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Seconds between refresh/retention sweeps (default: 3600)
    #[arg(long, value_name = "SECONDS")]
    sweep_interval: Option<u64>,

    /// Log output format (text, json, pretty)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Recover, sweep, drain the queues once, then exit (for testing)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(cli: &Cli) {
    let format = cli.log_format.unwrap_or_else(|| {
        std::env::var("MULTIPOST_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text)
    });

    let level = std::env::var("MULTIPOST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    LoggingConfig::new(format, level, cli.verbose).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    // Refuse to start without the master key: tokens stored under a
    // different key would be unreadable and every publish would fail late
    let master_key = config.encryption.require_master_key()?;

    let db = Database::new(&config.database.path).await?;
    let credentials = CredentialStore::new(db.clone(), master_key);
    let adapters = Arc::new(create_adapters(&config));

    info!(
        platforms = adapters.len(),
        workers_per_platform = config.workers.per_platform,
        "multipost-worker starting"
    );

    let (queues, receivers) = build_queues();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    setup_signal_handlers(Arc::clone(&shutdown_tx))?;

    let ctx = PublishContext {
        db: db.clone(),
        credentials: credentials.clone(),
        adapters: Arc::clone(&adapters),
        queues: queues.clone(),
        retry: RetryPolicy::from_config(&config.retry),
        call_timeout: Duration::from_secs(config.workers.call_timeout_secs),
    };

    let pool = WorkerPool::spawn(
        ctx,
        config.workers.per_platform,
        receivers,
        shutdown_rx.clone(),
    );

    let sweep = RefreshSweep::new(
        db.clone(),
        credentials,
        Arc::clone(&adapters),
        config.refresh.lookahead_secs,
    );

    recover_interrupted(&db, &queues).await?;

    if cli.once {
        run_sweeps(&sweep, &db, config.retention.audit_days).await;
        let _ = shutdown_tx.send(true);
        pool.join().await;
        info!("multipost-worker: single pass complete, exiting");
        return Ok(());
    }

    let poll_interval = cli.poll_interval.unwrap_or(60);
    let sweep_interval = cli.sweep_interval.unwrap_or(3600);
    // A target is only requeued by polling once it has sat untouched
    // longer than the longest scheduled retry delay
    let stale_secs = config.retry.max_delay_secs as i64;

    info!(poll_interval, sweep_interval, "daemon loop started");

    let mut last_sweep = chrono::Utc::now().timestamp();
    loop {
        if *shutdown_rx.borrow() {
            info!("shutdown requested, stopping daemon loop");
            break;
        }

        if let Err(e) = requeue_stale(&db, &queues, stale_secs).await {
            error!("queue maintenance failed: {}", e);
        }

        let now = chrono::Utc::now().timestamp();
        if now - last_sweep >= sweep_interval as i64 {
            run_sweeps(&sweep, &db, config.retention.audit_days).await;
            last_sweep = now;
        }

        // Sleep until the next poll, checking for shutdown every second
        for _ in 0..poll_interval {
            if *shutdown_rx.borrow() {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    let _ = shutdown_tx.send(true);
    pool.join().await;
    info!("multipost-worker stopped");
    Ok(())
}

fn setup_signal_handlers(shutdown: Arc<watch::Sender<bool>>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libmultipost::MultipostError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    let _ = shutdown.send(true);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

/// At-least-once recovery after a restart: targets left mid-flight by a
/// crash go back to retryable, then every open target is requeued. The
/// claim step makes any duplicate deliveries harmless.
async fn recover_interrupted(db: &Database, queues: &QueueSet) -> Result<()> {
    let open = db.non_terminal_targets().await?;
    if open.is_empty() {
        return Ok(());
    }

    info!(targets = open.len(), "recovering open targets");

    for target in open {
        if target.state == TargetState::Publishing {
            warn!(target_id = %target.id, "releasing target stuck in publishing");
            db.release_stuck_target(&target.id).await?;
        }

        enqueue_for_target(db, queues, &target).await?;
    }

    Ok(())
}

/// Requeue open targets that have sat untouched past the stale horizon.
/// Catches re-enqueue messages lost to a crash of the delayed-retry task.
async fn requeue_stale(db: &Database, queues: &QueueSet, stale_secs: i64) -> Result<()> {
    let cutoff = chrono::Utc::now().timestamp() - stale_secs;

    for target in db.non_terminal_targets().await? {
        if target.state == TargetState::Publishing || target.updated_at > cutoff {
            continue;
        }

        warn!(target_id = %target.id, state = %target.state, "requeueing stale target");
        enqueue_for_target(db, queues, &target).await?;
    }

    Ok(())
}

async fn enqueue_for_target(db: &Database, queues: &QueueSet, target: &Target) -> Result<()> {
    let Some(account) = db.get_account(&target.account_id).await? else {
        warn!(target_id = %target.id, account_id = %target.account_id, "target references missing account, skipping");
        return Ok(());
    };

    queues.enqueue(
        account.platform,
        ClaimMessage {
            target_id: target.id.clone(),
            attempt_count: target.attempt_count,
        },
    )
}

async fn run_sweeps(sweep: &RefreshSweep, db: &Database, retention_days: i64) {
    let now = chrono::Utc::now().timestamp();

    match sweep.run(now).await {
        Ok(report) => {
            if report.examined > 0 {
                info!(
                    refreshed = report.refreshed,
                    flagged = report.flagged,
                    "token refresh sweep complete"
                );
            }
        }
        Err(e) => error!("token refresh sweep failed: {}", e),
    }

    if let Err(e) = retention_sweep(db, now, retention_days).await {
        error!("retention sweep failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_intervals() {
        let cli = Cli::parse_from([
            "multipost-worker",
            "--poll-interval",
            "30",
            "--sweep-interval",
            "1800",
            "--verbose",
        ]);
        assert_eq!(cli.poll_interval, Some(30));
        assert_eq!(cli.sweep_interval, Some(1800));
        assert!(cli.verbose);
        assert!(!cli.once);
    }

    #[test]
    fn test_cli_parses_log_format() {
        let cli = Cli::parse_from(["multipost-worker", "--log-format", "json"]);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }
}
