//! attendsync - offline attendance capture and sync for KES-SMART kiosks.
//!
//! Scans are recorded locally and pushed to the KES-SMART server whenever
//! it is reachable. `attendsync run` keeps a kiosk syncing in the
//! background; the other subcommands are one-shot operations.

mod commands;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use attendsync_core::{Config, Runtime};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix inside the data directory's `logs/` folder
const LOG_FILE_PREFIX: &str = "attendsync.log";

#[derive(Parser)]
#[command(name = "attendsync", version, about = "Offline attendance capture and sync for KES-SMART")]
struct Cli {
    /// KES-SMART server base URL
    #[arg(long, global = true)]
    server: Option<String>,

    /// Directory for the offline database, caches and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Save a session token for API calls
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        role: Option<String>,
    },
    /// Forget the saved session
    Logout,
    /// Record an attendance scan
    Scan {
        #[command(subcommand)]
        method: ScanMethod,
        #[command(flatten)]
        context: ScanArgs,
    },
    /// Queue a form submission (JSON body)
    Form {
        form_type: String,
        data: String,
    },
    /// Sync pending records now
    Sync {
        /// Ignore retry backoff windows
        #[arg(long)]
        force: bool,
    },
    /// Show pending records, storage usage and connectivity
    Status {
        /// Also ask the server for its version
        #[arg(long)]
        check_server: bool,
    },
    /// Free local storage
    Cleanup {
        #[arg(long, conflicts_with_all = ["quick", "all"])]
        emergency: bool,
        #[arg(long, conflicts_with = "all")]
        quick: bool,
        /// Delete every cached response bucket
        #[arg(long)]
        all: bool,
    },
    /// Normalize legacy records in place
    Repair,
    /// Delete the offline database, including unsynced records
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Run the background sync daemon until interrupted
    Run,
}

#[derive(Subcommand)]
enum ScanMethod {
    /// Base64 student QR code
    Qr { data: String },
    /// 12-digit learner reference number
    Lrn { lrn: String },
    /// Student id entered by hand
    Manual {
        student_id: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Args)]
struct ScanArgs {
    #[arg(long, global = true)]
    subject: Option<String>,
    #[arg(long, global = true)]
    subject_name: Option<String>,
    #[arg(long, global = true)]
    location: Option<String>,
    #[arg(long, global = true)]
    notes: Option<String>,
}

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g., RUST_LOG=debug). When `log_dir`
/// is given, logs are also written to a daily-rotated file there.
fn init_tracing(default_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn load_config(cli: &Cli) -> (Config, Option<anyhow::Error>) {
    let (mut config, error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    (config, error)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let (config, config_error) = load_config(&cli);

    let daemon = matches!(cli.command, Command::Run);
    let _log_guard = if daemon {
        let log_dir = config.log_dir().ok();
        init_tracing("info", log_dir.as_deref())
    } else {
        init_tracing("warn", None)
    };
    if let Some(e) = config_error {
        warn!("Failed to load config, using defaults: {:#}", e);
    }

    let runtime = Runtime::start(config).await?;

    match cli.command {
        Command::Login { token, username, role } => commands::login(runtime, token, username, role).await,
        Command::Logout => commands::logout(runtime),
        Command::Scan { method, context } => {
            let mut scan = runtime.scan_context(context.subject);
            scan.subject_name = context.subject_name;
            scan.notes = context.notes;
            if context.location.is_some() {
                scan.location = context.location;
            }
            let method = match method {
                ScanMethod::Qr { data } => commands::ScanInput::Qr(data),
                ScanMethod::Lrn { lrn } => commands::ScanInput::Lrn(lrn),
                ScanMethod::Manual { student_id, name } => commands::ScanInput::Manual { student_id, name },
            };
            commands::scan(&runtime, method, &scan).await
        }
        Command::Form { form_type, data } => commands::form(&runtime, &form_type, &data).await,
        Command::Sync { force } => commands::sync(&runtime, force).await,
        Command::Status { check_server } => commands::status(&runtime, check_server).await,
        Command::Cleanup { emergency, quick, all } => {
            let mode = if all {
                commands::CleanupMode::All
            } else if emergency {
                commands::CleanupMode::Emergency
            } else if quick {
                commands::CleanupMode::Quick
            } else {
                commands::CleanupMode::Routine
            };
            commands::cleanup(&runtime, mode).await
        }
        Command::Repair => commands::repair(&runtime).await,
        Command::Reset { yes } => commands::reset(&runtime, yes).await,
        Command::Run => {
            info!("attendsync daemon starting");
            runtime
                .run_daemon(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for ctrl-c");
                    }
                })
                .await
        }
    }
}
