//! eos-updater-avahi: update the DNS-SD advertisement of this machine
//!
//! Writes or deletes the Avahi service files according to the server
//! configuration and the commits deployed in the sysroot.
//!
//! Exit codes: 0 OK, 1 failed, 2 invalid arguments, 3 bad configuration.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use eos_updater::advertise::service_file::services_dir;
use eos_updater::advertise::update_service_files;
use eos_updater::config::{Config, UpdateServerConfig};
use eos_updater::utils::bootstrap::init_tracing_with_default;

const EXIT_FAILED: u8 = 1;
const EXIT_INVALID_ARGUMENTS: u8 = 2;
const EXIT_BAD_CONFIGURATION: u8 = 3;

#[derive(Debug, Parser)]
#[command(
    name = "eos-updater-avahi",
    about = "Update the Avahi DNS-SD service advertisement for advertising updates from this machine to the local network"
)]
struct Args {
    /// Directory containing Avahi .service files.
    #[arg(short = 'd', long)]
    service_directory: Option<PathBuf>,

    /// Configuration file to use.
    #[arg(short, long)]
    config_file: Option<PathBuf>,

    /// Do not print anything; check exit status for success.
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(EXIT_INVALID_ARGUMENTS);
        }
        Err(e) => e.exit(),
    };
    init_tracing_with_default(if args.quiet { "error" } else { "info" });

    let loaded = UpdateServerConfig::load(args.config_file.as_deref())
        .and_then(|server| Ok((server, Config::load(None)?)));
    let (config, settings) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            if !args.quiet {
                error!("Error loading configuration file: {}", e);
            }
            return ExitCode::from(EXIT_BAD_CONFIGURATION);
        }
    };

    let dir = args.service_directory.unwrap_or_else(services_dir);
    match update_service_files(&settings.sysroot, config.advertise_updates, &dir) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            if !args.quiet {
                error!("Error updating Avahi service file: {}", e);
            }
            ExitCode::from(EXIT_FAILED)
        }
    }
}
