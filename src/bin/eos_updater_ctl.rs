//! eos-updater-ctl: drive a running eos-updater daemon
//!
//! ## Commands
//! - `status`: print the published properties
//! - `poll`, `poll-volume PATH`, `fetch`, `apply`, `cancel`: start the
//!   operation and wait for it to finish unless `--no-wait` is given
//! - `update`: poll, fetch and apply in turn
//! - `watch`: print every property change until interrupted
//!
//! ## Configuration
//! - `--endpoint` or EOS_UPDATER_ENDPOINT: daemon address (TCP URL or
//!   socket path); defaults to the transport of the daemon configuration

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;

use eos_updater::config::{Config, ENDPOINT_ENV_VAR};
use eos_updater::proto::{Properties, UpdaterState};
use eos_updater::utils::bootstrap::init_tracing_with_default;
use eos_updater_client::{ClientError, UpdaterClient, DEFAULT_ENDPOINT};

const EXIT_FAILED: u8 = 1;
const EXIT_INVALID_ARGUMENTS: u8 = 2;

#[derive(Debug, thiserror::Error)]
enum CtlError {
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The operation ended in a state other than the expected one.
    #[error("{state}: {message}")]
    Unexpected { state: &'static str, message: String },
}

impl CtlError {
    fn from_properties(props: Properties) -> Self {
        CtlError::Unexpected {
            state: props.updater_state().display_name(),
            message: props.error_message,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "eos-updater-ctl", about = "Control the eos-updater daemon")]
struct Args {
    /// Daemon endpoint.
    #[arg(short, long, env = ENDPOINT_ENV_VAR)]
    endpoint: Option<String>,

    /// Return as soon as the daemon accepts the call.
    #[arg(long, global = true)]
    no_wait: bool,

    /// Seconds to wait for an operation to finish.
    #[arg(long, global = true, default_value_t = 3600)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the daemon properties.
    #[command(alias = "properties")]
    Status,
    /// Check the configured sources for an update.
    Poll,
    /// Check a mounted volume for an update.
    PollVolume { path: String },
    /// Download the update found by the last poll.
    Fetch,
    /// Deploy the downloaded update.
    Apply,
    /// Cancel the running operation.
    Cancel,
    /// Poll, fetch and apply.
    Update,
    /// Print property changes as they happen.
    Watch,
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
    init_tracing_with_default("warn");

    let endpoint = args.endpoint.clone().unwrap_or_else(default_endpoint);
    let client = match UpdaterClient::connect(&endpoint).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Couldn't connect to {}: {}", endpoint, e);
            return ExitCode::from(EXIT_FAILED);
        }
    };

    match run(&client, &args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CtlError::Client(e)) => {
            match e.error_name() {
                Some(name) => eprintln!("{}: {}", name, e.message()),
                None => eprintln!("{}", e),
            }
            ExitCode::from(EXIT_FAILED)
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn default_endpoint() -> String {
    Config::load(None)
        .map(|config| config.transport.client_endpoint())
        .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
}

async fn run(client: &UpdaterClient, args: &Args) -> Result<(), CtlError> {
    let timeout = Duration::from_secs(args.timeout);
    match &args.command {
        Command::Status => {
            print_properties(&client.properties().await?);
            Ok(())
        }
        Command::Poll => {
            client.poll().await?;
            finish(client, args, UpdaterState::Polling, timeout).await
        }
        Command::PollVolume { path } => {
            client.poll_volume(path).await?;
            finish(client, args, UpdaterState::Polling, timeout).await
        }
        Command::Fetch => {
            client.fetch().await?;
            finish(client, args, UpdaterState::Fetching, timeout).await
        }
        Command::Apply => {
            client.apply().await?;
            finish(client, args, UpdaterState::ApplyingUpdate, timeout).await
        }
        Command::Cancel => {
            let state = client.cancel().await?;
            println!("{}", state.display_name());
            Ok(())
        }
        Command::Update => update(client, timeout).await,
        Command::Watch => {
            let mut stream = client.watch().await?;
            while let Some(props) = stream.next().await {
                let props = props.map_err(ClientError::from)?;
                println!("{}", describe(&props));
            }
            Ok(())
        }
    }
}

/// Wait for the transient state to pass and report where the daemon ended up.
async fn finish(
    client: &UpdaterClient,
    args: &Args,
    transient: UpdaterState,
    timeout: Duration,
) -> Result<(), CtlError> {
    if args.no_wait {
        return Ok(());
    }
    let props = client.wait_while(transient, timeout).await?;
    println!("{}", describe(&props));
    if props.updater_state() == UpdaterState::Error {
        return Err(CtlError::from_properties(props));
    }
    Ok(())
}

async fn update(client: &UpdaterClient, timeout: Duration) -> Result<(), CtlError> {
    client.poll().await?;
    let props = client.wait_while(UpdaterState::Polling, timeout).await?;
    println!("{}", describe(&props));
    match props.updater_state() {
        UpdaterState::UpdateAvailable => {}
        UpdaterState::Error => return Err(CtlError::from_properties(props)),
        _ => {
            println!("No update available");
            return Ok(());
        }
    }

    client.fetch().await?;
    let props = client.wait_while(UpdaterState::Fetching, timeout).await?;
    println!("{}", describe(&props));
    if props.updater_state() != UpdaterState::UpdateReady {
        return Err(CtlError::from_properties(props));
    }

    client.apply().await?;
    let props = client
        .wait_while(UpdaterState::ApplyingUpdate, timeout)
        .await?;
    println!("{}", describe(&props));
    if props.updater_state() != UpdaterState::UpdateApplied {
        return Err(CtlError::from_properties(props));
    }
    Ok(())
}

fn describe(props: &Properties) -> String {
    let state = props.updater_state();
    match state {
        UpdaterState::Error => format!(
            "{}: {} ({})",
            state.display_name(),
            props.error_message,
            props.error_name
        ),
        UpdaterState::Fetching => format!(
            "{}: {}/{} bytes",
            state.display_name(),
            props.downloaded_bytes,
            props.download_size
        ),
        UpdaterState::UpdateAvailable | UpdaterState::UpdateReady | UpdaterState::UpdateApplied => {
            format!("{}: {}", state.display_name(), props.update_id)
        }
        _ => state.display_name().to_string(),
    }
}

fn print_properties(props: &Properties) {
    println!("State: {}", props.updater_state().display_name());
    let fields = [
        ("UpdateID", props.update_id.clone()),
        ("UpdateRefspec", props.update_refspec.clone()),
        ("OriginalRefspec", props.original_refspec.clone()),
        ("UpdateLabel", props.update_label.clone()),
        ("UpdateMessage", props.update_message.clone()),
        ("Version", props.version.clone()),
        ("UpdateIsUserVisible", props.update_is_user_visible.to_string()),
        ("ReleaseNotesUri", props.release_notes_uri.clone()),
        ("DownloadSize", props.download_size.to_string()),
        ("UnpackedSize", props.unpacked_size.to_string()),
        ("FullDownloadSize", props.full_download_size.to_string()),
        ("FullUnpackedSize", props.full_unpacked_size.to_string()),
        ("DownloadedBytes", props.downloaded_bytes.to_string()),
        ("ErrorName", props.error_name.clone()),
        ("ErrorCode", props.error_code.to_string()),
        ("ErrorMessage", props.error_message.clone()),
        ("OfflineOnly", props.offline_only.to_string()),
    ];
    for (name, value) in fields {
        println!("{}: {}", name, value);
    }
}
