use clap::Parser;
use query_daemon::daemon::{self, DaemonConfig, DaemonError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Workspace query daemon. Spawned by the client CLI; exits on idle
/// timeout, termination signal, or the `shutdown` RPC.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Per-workspace code navigation daemon")]
struct Args {
    /// Solution, project file, or directory containing exactly one.
    workspace: PathBuf,

    /// Minutes without requests before self-shutdown (0 disables).
    #[clap(long, default_value_t = 30)]
    idle_timeout: u64,

    /// Log filter when RUST_LOG is unset (trace, debug, info, warn, error).
    #[clap(long, default_value = "info")]
    log_level: String,
}

// Exit codes are part of the spawned-process contract: 0 clean shutdown
// (or already running), 1 fatal runtime error, 2 workspace load failure.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workspace = %args.workspace.display(),
        "starting daemon"
    );

    let mut config = DaemonConfig::new(args.workspace);
    config.idle_timeout = Duration::from_secs(args.idle_timeout * 60);

    let code = match daemon::run(config).await {
        Ok(()) => 0,
        Err(DaemonError::AlreadyRunning(pid)) => {
            info!(pid, "daemon already running for this workspace");
            0
        }
        Err(DaemonError::Load(e)) => {
            error!(error = %e, "workspace load failure");
            2
        }
        Err(DaemonError::Runtime(e)) => {
            error!(error = %e, "fatal daemon error");
            1
        }
    };
    std::process::exit(code);
}
