//! Default client wrapping the tonic-generated updater client.

use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::proto::{
    updater_client::UpdaterClient as TonicUpdaterClient, ApplyRequest, CancelRequest,
    FetchRequest, PollRequest, PollVolumeRequest, Properties, PropertiesRequest, UpdaterState,
};

/// Default daemon endpoint when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:50151";

/// Create a gRPC channel from an endpoint string.
///
/// Supports both TCP (host:port or http://host:port) and Unix Domain Sockets.
/// UDS paths are detected by leading '/' or './' and use a custom connector.
async fn create_channel(endpoint: &str) -> Result<Channel> {
    let uds_path = if endpoint.starts_with('/') || endpoint.starts_with("./") {
        Some(endpoint.to_string())
    } else {
        endpoint.strip_prefix("unix://").map(str::to_string)
    };

    if let Some(path) = uds_path {
        // The URI is ignored for UDS, but tonic requires a valid one
        let channel = Endpoint::try_from("http://[::]:50151")
            .map_err(|e| ClientError::Connection(e.to_string()))?
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    tokio::net::UnixStream::connect(path)
                        .await
                        .map(hyper_util::rt::TokioIo::new)
                }
            }))
            .await?;
        Ok(channel)
    } else {
        let uri = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };
        let channel = Channel::from_shared(uri)
            .map_err(|e| ClientError::Connection(e.to_string()))?
            .connect()
            .await?;
        Ok(channel)
    }
}

/// Client for the update daemon.
#[derive(Clone)]
pub struct UpdaterClient {
    inner: TonicUpdaterClient<Channel>,
}

impl UpdaterClient {
    /// Connect to the daemon at the given endpoint.
    ///
    /// Supports both TCP (host:port) and Unix Domain Sockets (file paths).
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let channel = create_channel(endpoint).await?;
        Ok(Self::from_channel(channel))
    }

    /// Connect using an endpoint from environment variable with fallback.
    pub async fn from_env(env_var: &str, default: &str) -> Result<Self> {
        let endpoint = std::env::var(env_var).unwrap_or_else(|_| default.to_string());
        Self::connect(&endpoint).await
    }

    /// Create a client from an existing channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: TonicUpdaterClient::new(channel),
        }
    }

    /// Start polling the configured sources for an update.
    pub async fn poll(&self) -> Result<UpdaterState> {
        let response = self.inner.clone().poll(PollRequest {}).await?;
        Ok(state_of(response.into_inner().state))
    }

    /// Start polling a mounted volume for an update.
    pub async fn poll_volume(&self, path: &str) -> Result<UpdaterState> {
        if !path.starts_with('/') {
            return Err(ClientError::InvalidArgument(format!(
                "volume path must be absolute: {}",
                path
            )));
        }
        let response = self
            .inner
            .clone()
            .poll_volume(PollVolumeRequest {
                path: path.to_string(),
            })
            .await?;
        Ok(state_of(response.into_inner().state))
    }

    /// Start downloading the update found by the last poll.
    pub async fn fetch(&self) -> Result<UpdaterState> {
        let response = self.inner.clone().fetch(FetchRequest {}).await?;
        Ok(state_of(response.into_inner().state))
    }

    /// Start deploying the downloaded update.
    pub async fn apply(&self) -> Result<UpdaterState> {
        let response = self.inner.clone().apply(ApplyRequest {}).await?;
        Ok(state_of(response.into_inner().state))
    }

    /// Cancel the running operation, if any.
    pub async fn cancel(&self) -> Result<UpdaterState> {
        let response = self.inner.clone().cancel(CancelRequest {}).await?;
        Ok(state_of(response.into_inner().state))
    }

    /// Snapshot of all published properties.
    pub async fn properties(&self) -> Result<Properties> {
        let response = self
            .inner
            .clone()
            .get_properties(PropertiesRequest {})
            .await?;
        Ok(response.into_inner())
    }

    /// Stream of property snapshots, starting with the current one.
    pub async fn watch(&self) -> Result<tonic::Streaming<Properties>> {
        let response = self
            .inner
            .clone()
            .watch_properties(PropertiesRequest {})
            .await?;
        Ok(response.into_inner())
    }

    /// Wait until the daemon leaves the given transient state.
    ///
    /// Returns the first property snapshot whose state differs from
    /// `transient`. Gives up after `timeout`.
    pub async fn wait_while(&self, transient: UpdaterState, timeout: Duration) -> Result<Properties> {
        let mut stream = self.watch().await?;

        let wait = async {
            while let Some(item) = stream.next().await {
                let props = item?;
                debug!(state = props.updater_state().display_name(), "property update");
                if props.updater_state() != transient {
                    return Ok(props);
                }
            }
            Err(ClientError::StreamClosed)
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ClientError::Connection(format!(
                "timed out waiting to leave state {}",
                transient.display_name()
            ))
        })?
    }
}

fn state_of(raw: i32) -> UpdaterState {
    UpdaterState::try_from(raw).unwrap_or(UpdaterState::None)
}
