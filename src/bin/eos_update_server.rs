//! eos-update-server: serve the local repositories to peers
//!
//! Serves every `[Repository N]` of the server configuration (or the
//! system repository alone) over HTTP, and exits after a period without
//! requests.
//!
//! Exit codes: 0 OK, 1 failed, 2 invalid arguments, 3 bad configuration,
//! 4 disabled by configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use eos_updater::config::{Config, UpdateServerConfig};
use eos_updater::refspec::Refspec;
use eos_updater::server::{RepoServer, ServedRepository};
use eos_updater::sysroot::Sysroot;
use eos_updater::utils::bootstrap::{init_tracing, shutdown_signal};

const EXIT_FAILED: u8 = 1;
const EXIT_INVALID_ARGUMENTS: u8 = 2;
const EXIT_BAD_CONFIGURATION: u8 = 3;
const EXIT_DISABLED: u8 = 4;

#[derive(Debug, Parser)]
#[command(
    name = "eos-update-server",
    about = "Serve the local OSTree repository to other computers on the network"
)]
struct Args {
    /// Local port number (0 picks an ephemeral port).
    #[arg(short = 'p', long, default_value_t = 0)]
    local_port: u16,

    /// File to write the port number in.
    #[arg(short = 'f', long)]
    port_file: Option<PathBuf>,

    /// Seconds of inactivity allowed before exiting (≤ 0 means no timeout).
    #[arg(short, long, default_value_t = 200, allow_negative_numbers = true)]
    timeout: i64,

    /// Name of the remote to serve.
    #[arg(short = 'r', long, visible_alias = "serve-remote", default_value = "eos")]
    served_remote: String,

    /// Configuration file to use.
    #[arg(short, long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(EXIT_INVALID_ARGUMENTS);
        }
        Err(e) => e.exit(),
    };
    init_tracing();

    if Refspec::parse(&format!("{}:test", args.served_remote))
        .ok()
        .and_then(|r| r.remote)
        .as_deref()
        != Some(args.served_remote.as_str())
    {
        error!("Badly-formed remote name {}", args.served_remote);
        return ExitCode::from(EXIT_INVALID_ARGUMENTS);
    }

    let config = match UpdateServerConfig::load(args.config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration file: {}", e);
            return ExitCode::from(EXIT_BAD_CONFIGURATION);
        }
    };
    if !config.advertise_updates {
        info!("Advertising updates is disabled in the configuration file. Exiting.");
        return ExitCode::from(EXIT_DISABLED);
    }

    let server = match open_server(&config, &args.served_remote) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open repository: {}", e);
            return ExitCode::from(EXIT_FAILED);
        }
    };

    match run(server, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

/// The configured repositories, or the system repository when none are.
fn open_server(
    config: &UpdateServerConfig,
    served_remote: &str,
) -> Result<RepoServer, Box<dyn std::error::Error>> {
    if !config.repositories.is_empty() {
        return Ok(RepoServer::from_config(&config.repositories)?);
    }
    let settings = Config::load(None)?;
    let repo = Sysroot::new(&settings.sysroot).repo()?;
    Ok(RepoServer::new(vec![ServedRepository::new(repo, "", served_remote)]))
}

async fn run(server: RepoServer, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("0.0.0.0", args.local_port)).await?;
    let port = listener.local_addr()?.port();
    if let Some(path) = &args.port_file {
        tokio::fs::write(path, port.to_string()).await?;
    }

    let stats = server.stats();
    let timeout = u64::try_from(args.timeout).ok().filter(|&t| t > 0);
    let shutdown = async move {
        match timeout {
            Some(seconds) => tokio::select! {
                _ = stats.wait_idle(Duration::from_secs(seconds)) => {
                    info!(timeout_secs = seconds, "No requests; exiting");
                }
                _ = shutdown_signal() => {}
            },
            None => shutdown_signal().await,
        }
    };

    server.serve(listener, shutdown).await?;
    Ok(())
}
