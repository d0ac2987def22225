//! eos-updater-test-checkpoint: would this system cross a checkpoint?
//!
//! Evaluates the checkpoint policy of the booted commit for moving from
//! SOURCE_REF to TARGET_REF and prints the verdict.
//!
//! Exit codes: 0 verdict printed, 1 failed, 2 invalid arguments.

use std::process::ExitCode;

use clap::Parser;

use eos_updater::checkpoint::should_follow_commit;
use eos_updater::config::Config;
use eos_updater::sysroot::Sysroot;
use eos_updater::utils::bootstrap::init_tracing_with_default;
use eos_updater::UpdaterError;

const EXIT_FAILED: u8 = 1;
const EXIT_INVALID_ARGUMENTS: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "eos-updater-test-checkpoint",
    about = "Test whether upgrading across a checkpoint from SOURCE_REF to TARGET_REF would be permitted"
)]
struct Args {
    source_ref: String,
    target_ref: String,
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
    init_tracing_with_default("warn");

    let settings = match Config::load(None) {
        Ok(config) => config.sysroot,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_FAILED);
        }
    };

    match evaluate(&settings, &args.source_ref, &args.target_ref) {
        Ok(()) => {
            println!(
                "This system would upgrade from {} to {}",
                args.source_ref, args.target_ref
            );
            ExitCode::SUCCESS
        }
        Err(UpdaterError::CheckpointBlock(block)) => {
            println!(
                "This system would not upgrade from {} to {} due to {}: {}",
                args.source_ref, args.target_ref, block.reason, block.detail
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn evaluate(
    settings: &eos_updater::config::SysrootSettings,
    source_ref: &str,
    target_ref: &str,
) -> eos_updater::Result<()> {
    let mut sysroot = Sysroot::new(settings);
    sysroot.load().map_err(|e| {
        UpdaterError::NotOstreeSystem(format!(
            "Couldn't open sysroot (not an ostree system?): {}",
            e
        ))
    })?;
    let booted = sysroot
        .booted_deployment()
        .ok_or_else(UpdaterError::not_ostree_system)?;
    let repo = sysroot.repo()?;
    should_follow_commit(&repo, &booted.checksum, source_ref, target_ref)
}
