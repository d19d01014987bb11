//! Swarm Daemon
//!
//! Supervises agent swarms: reconciles persisted state on startup, keeps
//! the checkpoint flusher running and stops swarms cleanly on shutdown.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use swarm_daemon::SwarmSupervisor;
use swarm_daemon::reconcile;
use swarm_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "swarm-daemon")]
#[command(version, about = "Swarm supervisor - agent process lifecycle daemon")]
struct Args {
    /// Database file path
    #[arg(long, env = "SWARM_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Project directory whose `.swarm/settings.json` is layered over the
    /// global settings.
    #[arg(long, env = "SWARM_PROJECT_DIR", global = true)]
    project_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "SWARM_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SWARM_LOG_JSON", global = true)]
    log_json: bool,

    /// Leave agents running when the daemon stops.
    #[arg(long, env = "SWARM_KEEP_AGENTS")]
    keep_agents: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor until Ctrl+C or SIGTERM (default).
    Serve,
    /// Reconcile persisted state once and print the report as JSON.
    Reconcile,
    /// Print a project's runs as JSON.
    Runs {
        #[arg(long)]
        project: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = swarm_core::config::load_config(args.project_dir.as_deref())?;
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    if args.keep_agents {
        config.supervisor.stop_agents_on_shutdown = false;
    }

    let log_filter =
        swarm_core::tracing_init::crate_filter(env!("CARGO_PKG_NAME"), &config.daemon.log_level);
    swarm_core::tracing_init::init_tracing(&log_filter, args.log_json || config.daemon.log_json)?;

    let db_path = match args.db_path.clone().or_else(|| config.daemon.database_path.clone()) {
        Some(path) => path,
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(db, config).await,
        Command::Reconcile => {
            let report = reconcile::reconcile(&db).await?;
            print_json(&report)
        }
        Command::Runs { project } => {
            let supervisor = SwarmSupervisor::new(db, config);
            let runs = supervisor.list_runs(&project).await?;
            print_json(&runs)
        }
    }
}

async fn serve(db: Database, config: swarm_core::Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        launcher = %config.launcher.program.display(),
        stop_agents_on_shutdown = config.supervisor.stop_agents_on_shutdown,
        "Starting swarm-daemon"
    );

    let supervisor = SwarmSupervisor::new(db, config);
    let report = supervisor.start().await?;
    info!(
        inspected = report.inspected,
        repaired = report.repaired.len(),
        "Startup reconciliation done"
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so agents don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!("Supervisor ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    supervisor.shutdown().await;
    info!("Daemon stopped");
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Default database path: the config dir, else ~/.swarm/swarm.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = swarm_core::config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".swarm").join("swarm.db"))
}
