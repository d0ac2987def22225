//! eos-updater: OS update daemon
//!
//! Runs the update state machine and exposes it over gRPC.
//!
//! ## Architecture
//! ```text
//! [eos-updater-ctl / UI] --(Updater gRPC)--> [eos-updater] --> [Updater actor]
//!                                                                   |
//!                                      +----------------------------+
//!                                      v              v             v
//!                                 [origin]      [LAN peers]   [USB volumes]
//! ```
//!
//! ## Configuration
//! - `--config`/`-c` or EOS_UPDATER_CONFIG: YAML settings file
//! - EOS_UPDATER__SECTION__KEY: individual overrides
//! - EOS_UPDATER_LOG: log filter (default: info)

use clap::Parser;
use tonic::transport::Server;
use tonic_health::server::health_reporter;
use tracing::info;

use eos_updater::config::Config;
use eos_updater::facade::UpdaterService;
use eos_updater::proto::updater_server::UpdaterServer;
use eos_updater::transport::{grpc_trace_layer, serve_with_transport_and_shutdown};
use eos_updater::utils::bootstrap::{init_tracing, shutdown_signal};
use eos_updater::Updater;

#[derive(Debug, Parser)]
#[command(name = "eos-updater", about = "Endless OS updater daemon")]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let config = Config::load(args.config.as_deref())?;
    info!(
        sysroot = %config.sysroot.path.display(),
        endpoint = %config.transport.client_endpoint(),
        "eos-updater starting"
    );

    let updater = Updater::spawn(config.clone());
    info!(state = %updater.state(), "Updater initialised");

    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<UpdaterServer<UpdaterService>>()
        .await;

    let router = Server::builder()
        .layer(grpc_trace_layer())
        .add_service(health_service)
        .add_service(UpdaterService::new(updater.clone()).into_server());

    serve_with_transport_and_shutdown(router, &config.transport, shutdown_signal()).await?;

    // Let a running operation unwind before the runtime goes away.
    if updater.state().is_busy() {
        let state = updater.cancel().await?;
        info!(state = %state, "Cancelled running operation");
    }
    info!("eos-updater stopped");
    Ok(())
}
