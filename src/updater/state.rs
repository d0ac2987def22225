//! Updater states, the allowed transitions between them and the published
//! property block.

use std::fmt;

use crate::error::UpdaterError;
use crate::repo::CommitSizes;

use super::candidate::UpdateCandidate;

/// Lifecycle state of the updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdaterState {
    /// Not yet initialised.
    #[default]
    None,
    Ready,
    Error,
    Polling,
    UpdateAvailable,
    Fetching,
    UpdateReady,
    ApplyingUpdate,
    UpdateApplied,
}

impl UpdaterState {
    pub fn name(self) -> &'static str {
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

    /// States from which `Poll()` and `PollVolume()` may be called.
    pub fn can_poll(self) -> bool {
        matches!(
            self,
            UpdaterState::Ready
                | UpdaterState::Error
                | UpdaterState::UpdateAvailable
                | UpdaterState::UpdateReady
        )
    }

    pub fn can_fetch(self) -> bool {
        self == UpdaterState::UpdateAvailable
    }

    pub fn can_apply(self) -> bool {
        self == UpdaterState::UpdateReady
    }

    /// Whether a background operation runs in this state.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            UpdaterState::Polling | UpdaterState::Fetching | UpdaterState::ApplyingUpdate
        )
    }

    /// Whether `self → next` appears in the transition table.
    ///
    /// Entering `Error` is always allowed.
    pub fn allows(self, next: UpdaterState) -> bool {
        use UpdaterState::*;
        if next == Error {
            return true;
        }
        match (self, next) {
            (None, Ready) => true,
            (from, Polling) => from.can_poll(),
            (Polling, UpdateAvailable | Ready) => true,
            (UpdateAvailable, Fetching) => true,
            (Fetching, UpdateReady) => true,
            (UpdateReady, ApplyingUpdate) => true,
            (ApplyingUpdate, UpdateApplied) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of everything the updater publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Properties {
    pub state: UpdaterState,
    pub update_id: String,
    pub update_refspec: String,
    pub original_refspec: String,
    pub update_label: String,
    pub update_message: String,
    pub version: String,
    pub update_is_user_visible: bool,
    pub release_notes_uri: String,
    pub download_size: i64,
    pub unpacked_size: i64,
    pub full_download_size: i64,
    pub full_unpacked_size: i64,
    pub downloaded_bytes: i64,
    /// Empty when there is no error.
    pub error_name: String,
    pub error_code: u32,
    pub error_message: String,
    pub offline_only: bool,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            state: UpdaterState::None,
            update_id: String::new(),
            update_refspec: String::new(),
            original_refspec: String::new(),
            update_label: String::new(),
            update_message: String::new(),
            version: String::new(),
            update_is_user_visible: false,
            release_notes_uri: String::new(),
            download_size: 0,
            unpacked_size: 0,
            full_download_size: 0,
            full_unpacked_size: 0,
            downloaded_bytes: 0,
            error_name: String::new(),
            error_code: 0,
            error_message: String::new(),
            offline_only: false,
        }
    }
}

impl Properties {
    /// Reset every update field, keeping state and error.
    pub fn clear_update(&mut self) {
        let keep = Properties {
            state: self.state,
            error_name: std::mem::take(&mut self.error_name),
            error_code: self.error_code,
            error_message: std::mem::take(&mut self.error_message),
            ..Properties::default()
        };
        *self = keep;
    }

    pub fn set_error(&mut self, error: &UpdaterError) {
        self.error_name = error.name().to_string();
        self.error_code = error.code();
        self.error_message = error.to_string();
    }

    pub fn clear_error(&mut self) {
        self.error_name.clear();
        self.error_code = 0;
        self.error_message.clear();
    }

    pub fn has_error(&self) -> bool {
        self.error_code != 0
    }

    /// Publish the fields describing `candidate`.
    pub fn set_candidate(&mut self, candidate: &UpdateCandidate) {
        let CommitSizes {
            archived,
            unpacked,
            new_archived,
            new_unpacked,
        } = candidate.sizes;
        self.update_id = candidate.checksum.clone();
        self.update_refspec = candidate.new_refspec.to_string();
        self.original_refspec = candidate.old_refspec.to_string();
        self.update_label = candidate.label.clone();
        self.update_message = candidate.message.clone();
        self.version = candidate.version.clone().unwrap_or_default();
        self.update_is_user_visible = candidate.is_user_visible;
        self.release_notes_uri = candidate.release_notes_uri.clone().unwrap_or_default();
        self.full_download_size = archived;
        self.full_unpacked_size = unpacked;
        self.download_size = new_archived;
        self.unpacked_size = new_unpacked;
        self.downloaded_bytes = if candidate.sizes == CommitSizes::UNKNOWN { -1 } else { 0 };
        self.offline_only = candidate.offline_only;
    }

    /// Record download progress; never decreases and never exceeds a known
    /// download size.
    pub fn record_progress(&mut self, bytes: u64) {
        let mut bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        if self.download_size >= 0 {
            bytes = bytes.min(self.download_size);
        }
        self.downloaded_bytes = self.downloaded_bytes.max(bytes);
    }
}
