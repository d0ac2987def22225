//! Remote-call façade.
//!
//! Exposes an [`Updater`] over gRPC. Method calls return once the actor has
//! accepted or rejected them; clients follow progress through
//! `GetProperties` and the `WatchProperties` stream. Rejections carry the
//! updater error name in the `x-eos-updater-error` metadata entry.

use std::path::Path;
use std::pin::Pin;

use eos_updater_client::proto::updater_server::{Updater as UpdaterRpc, UpdaterServer};
use eos_updater_client::proto::{
    self as pb, ApplyRequest, CancelRequest, CancelResponse, FetchRequest, OperationAccepted,
    PollRequest, PollVolumeRequest, PropertiesRequest,
};
use eos_updater_client::ERROR_NAME_METADATA_KEY;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tonic::metadata::MetadataValue;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info};

use crate::error::UpdaterError;
use crate::updater::{Properties, Updater, UpdaterState};

/// gRPC service backed by the updater actor.
#[derive(Clone)]
pub struct UpdaterService {
    updater: Updater,
}

impl UpdaterService {
    pub fn new(updater: Updater) -> Self {
        Self { updater }
    }

    /// Wrap into the tonic server type.
    pub fn into_server(self) -> UpdaterServer<Self> {
        UpdaterServer::new(self)
    }

    fn accepted(&self) -> Response<OperationAccepted> {
        Response::new(OperationAccepted {
            state: state_to_proto(self.updater.state()) as i32,
        })
    }
}

#[tonic::async_trait]
impl UpdaterRpc for UpdaterService {
    type WatchPropertiesStream = Pin<Box<dyn Stream<Item = Result<pb::Properties, Status>> + Send>>;

    async fn poll(&self, _request: Request<PollRequest>) -> Result<Response<OperationAccepted>, Status> {
        debug!("Poll called");
        self.updater.poll().await.map_err(to_status)?;
        Ok(self.accepted())
    }

    async fn poll_volume(
        &self,
        request: Request<PollVolumeRequest>,
    ) -> Result<Response<OperationAccepted>, Status> {
        let path = request.into_inner().path;
        if path.is_empty() || !Path::new(&path).is_absolute() {
            return Err(Status::invalid_argument(format!(
                "Volume path must be absolute: ‘{}’",
                path
            )));
        }
        info!(path = %path, "PollVolume called");
        self.updater.poll_volume(path).await.map_err(to_status)?;
        Ok(self.accepted())
    }

    async fn fetch(&self, _request: Request<FetchRequest>) -> Result<Response<OperationAccepted>, Status> {
        debug!("Fetch called");
        self.updater.fetch().await.map_err(to_status)?;
        Ok(self.accepted())
    }

    async fn apply(&self, _request: Request<ApplyRequest>) -> Result<Response<OperationAccepted>, Status> {
        debug!("Apply called");
        self.updater.apply().await.map_err(to_status)?;
        Ok(self.accepted())
    }

    async fn cancel(&self, _request: Request<CancelRequest>) -> Result<Response<CancelResponse>, Status> {
        debug!("Cancel called");
        let state = self.updater.cancel().await.map_err(to_status)?;
        Ok(Response::new(CancelResponse {
            state: state_to_proto(state) as i32,
        }))
    }

    async fn get_properties(
        &self,
        _request: Request<PropertiesRequest>,
    ) -> Result<Response<pb::Properties>, Status> {
        Ok(Response::new(properties_to_proto(&self.updater.properties())))
    }

    async fn watch_properties(
        &self,
        _request: Request<PropertiesRequest>,
    ) -> Result<Response<Self::WatchPropertiesStream>, Status> {
        let stream = WatchStream::new(self.updater.watch()).map(|props| Ok(properties_to_proto(&props)));
        Ok(Response::new(Box::pin(stream)))
    }
}

// ============================================================================
// Conversions
// ============================================================================

pub fn state_to_proto(state: UpdaterState) -> pb::UpdaterState {
    match state {
        UpdaterState::None => pb::UpdaterState::None,
        UpdaterState::Ready => pb::UpdaterState::Ready,
        UpdaterState::Error => pb::UpdaterState::Error,
        UpdaterState::Polling => pb::UpdaterState::Polling,
        UpdaterState::UpdateAvailable => pb::UpdaterState::UpdateAvailable,
        UpdaterState::Fetching => pb::UpdaterState::Fetching,
        UpdaterState::UpdateReady => pb::UpdaterState::UpdateReady,
        UpdaterState::ApplyingUpdate => pb::UpdaterState::ApplyingUpdate,
        UpdaterState::UpdateApplied => pb::UpdaterState::UpdateApplied,
    }
}

pub fn properties_to_proto(props: &Properties) -> pb::Properties {
    pb::Properties {
        state: state_to_proto(props.state) as i32,
        update_id: props.update_id.clone(),
        update_refspec: props.update_refspec.clone(),
        original_refspec: props.original_refspec.clone(),
        update_label: props.update_label.clone(),
        update_message: props.update_message.clone(),
        version: props.version.clone(),
        update_is_user_visible: props.update_is_user_visible,
        release_notes_uri: props.release_notes_uri.clone(),
        download_size: props.download_size,
        unpacked_size: props.unpacked_size,
        full_download_size: props.full_download_size,
        full_unpacked_size: props.full_unpacked_size,
        downloaded_bytes: props.downloaded_bytes,
        error_name: props.error_name.clone(),
        error_code: props.error_code,
        error_message: props.error_message.clone(),
        offline_only: props.offline_only,
    }
}

fn status_code(error: &UpdaterError) -> Code {
    match error {
        UpdaterError::WrongState(_)
        | UpdaterError::LiveBoot(_)
        | UpdaterError::CheckpointBlock(_)
        | UpdaterError::WrongConfiguration(_)
        | UpdaterError::NotOstreeSystem(_) => Code::FailedPrecondition,
        UpdaterError::Network(_) => Code::Unavailable,
        UpdaterError::NotFound(_) => Code::NotFound,
        UpdaterError::Corrupt(_) => Code::DataLoss,
        UpdaterError::Cancelled(_) => Code::Cancelled,
        UpdaterError::InvalidConfig(_) => Code::InvalidArgument,
        UpdaterError::Deploy(_) | UpdaterError::Io(_) => Code::Internal,
    }
}

/// Map an updater error to a status carrying its name in metadata.
pub fn to_status(error: UpdaterError) -> Status {
    let mut status = Status::new(status_code(&error), error.to_string());
    status
        .metadata_mut()
        .insert(ERROR_NAME_METADATA_KEY, MetadataValue::from_static(error.name()));
    status
}

#[cfg(test)]
mod tests;
