//! Generated protobuf and gRPC types for the updater surface.

tonic::include_proto!("eos_updater");

impl UpdaterState {
    /// Name used in logs and user-facing messages.
    pub fn display_name(self) -> &'static str {
        match self {
            UpdaterState::None => "None",
            UpdaterState::Ready => "Ready",
            UpdaterState::Error => "Error",
            UpdaterState::Polling => "Polling",
            UpdaterState::UpdateAvailable => "UpdateAvailable",
            UpdaterState::Fetching => "Fetching",
            UpdaterState::UpdateReady => "UpdateReady",
            UpdaterState::ApplyingUpdate => "ApplyingUpdate",
            UpdaterState::UpdateApplied => "UpdateApplied",
        }
    }
}

impl Properties {
    /// Decoded state, falling back to `None` for unknown wire values.
    pub fn updater_state(&self) -> UpdaterState {
        UpdaterState::try_from(self.state).unwrap_or(UpdaterState::None)
    }
}
