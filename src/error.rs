//! Error taxonomy shared by the state machine, its operations and the façade.
//!
//! Every failure that can surface to a client is one of these variants. The
//! payload is the human-readable message; [`UpdaterError::name`] and
//! [`UpdaterError::code`] give the stable machine-readable identity that ends
//! up in the `ErrorCode`/`ErrorName` properties.

use crate::checkpoint::CheckpointBlock;

/// Result type for updater operations.
pub type Result<T> = std::result::Result<T, UpdaterError>;

/// Errors reported by the updater.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdaterError {
    /// Method invoked in a state that does not allow it.
    #[error("{0}")]
    WrongState(String),

    /// Running on a live (installer) image.
    #[error("{0}")]
    LiveBoot(String),

    /// Transport, DNS or protocol failure.
    #[error("{0}")]
    Network(String),

    /// The source lacks the requested ref or commit.
    #[error("{0}")]
    NotFound(String),

    /// Checksum or content verification failed.
    #[error("{0}")]
    Corrupt(String),

    /// The checkpoint policy declined to cross to the target ref.
    #[error("{0}")]
    CheckpointBlock(CheckpointBlock),

    /// The operation was cancelled by the user.
    #[error("{0}")]
    Cancelled(String),

    /// A sysroot deployment operation failed.
    #[error("{0}")]
    Deploy(String),

    /// Malformed configuration file.
    #[error("{0}")]
    InvalidConfig(String),

    /// Well-formed configuration with unusable values.
    #[error("{0}")]
    WrongConfiguration(String),

    /// The running system has no booted deployment.
    #[error("{0}")]
    NotOstreeSystem(String),

    /// Local filesystem failure outside a deployment.
    #[error("{0}")]
    Io(String),
}

impl UpdaterError {
    /// Standard cancellation error.
    pub fn cancelled() -> Self {
        UpdaterError::Cancelled("Operation was cancelled".to_string())
    }

    /// Error returned by every method on a live system.
    pub fn live_boot() -> Self {
        UpdaterError::LiveBoot("Updater disabled on live systems".to_string())
    }

    /// Error reported at start when no deployment is booted.
    pub fn not_ostree_system() -> Self {
        UpdaterError::NotOstreeSystem("Not an OSTree-based system: cannot update it.".to_string())
    }

    /// Stable machine-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            UpdaterError::WrongState(_) => "WRONG_STATE",
            UpdaterError::LiveBoot(_) => "LIVE_BOOT",
            UpdaterError::Network(_) => "NETWORK",
            UpdaterError::NotFound(_) => "NOT_FOUND",
            UpdaterError::Corrupt(_) => "CORRUPT",
            UpdaterError::CheckpointBlock(_) => "CHECKPOINT_BLOCK",
            UpdaterError::Cancelled(_) => "CANCELLED",
            UpdaterError::Deploy(_) => "DEPLOY",
            UpdaterError::InvalidConfig(_) => "INVALID_CONFIG",
            UpdaterError::WrongConfiguration(_) => "WRONG_CONFIGURATION",
            UpdaterError::NotOstreeSystem(_) => "NOT_OSTREE_SYSTEM",
            UpdaterError::Io(_) => "IO",
        }
    }

    /// Stable numeric code. Zero is reserved for "no error".
    pub fn code(&self) -> u32 {
        match self {
            UpdaterError::WrongState(_) => 1,
            UpdaterError::LiveBoot(_) => 2,
            UpdaterError::Network(_) => 3,
            UpdaterError::NotFound(_) => 4,
            UpdaterError::Corrupt(_) => 5,
            UpdaterError::CheckpointBlock(_) => 6,
            UpdaterError::Cancelled(_) => 7,
            UpdaterError::Deploy(_) => 8,
            UpdaterError::InvalidConfig(_) => 9,
            UpdaterError::WrongConfiguration(_) => 10,
            UpdaterError::NotOstreeSystem(_) => 11,
            UpdaterError::Io(_) => 12,
        }
    }

    /// Returns true for user-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpdaterError::Cancelled(_))
    }

    /// Returns true for errors worth a bounded local retry.
    ///
    /// Only transport failures qualify; corrupt content is never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpdaterError::Network(_))
    }

    /// Returns a copy of this error with `extra` appended to its message.
    ///
    /// The variant is preserved so the error name and code do not change.
    pub fn annotate(self, extra: &str) -> Self {
        let join = |msg: String| format!("{}; {}", msg, extra);
        match self {
            UpdaterError::WrongState(m) => UpdaterError::WrongState(join(m)),
            UpdaterError::LiveBoot(m) => UpdaterError::LiveBoot(join(m)),
            UpdaterError::Network(m) => UpdaterError::Network(join(m)),
            UpdaterError::NotFound(m) => UpdaterError::NotFound(join(m)),
            UpdaterError::Corrupt(m) => UpdaterError::Corrupt(join(m)),
            UpdaterError::CheckpointBlock(mut block) => {
                block.detail = join(block.detail);
                UpdaterError::CheckpointBlock(block)
            }
            UpdaterError::Cancelled(m) => UpdaterError::Cancelled(join(m)),
            UpdaterError::Deploy(m) => UpdaterError::Deploy(join(m)),
            UpdaterError::InvalidConfig(m) => UpdaterError::InvalidConfig(join(m)),
            UpdaterError::WrongConfiguration(m) => UpdaterError::WrongConfiguration(join(m)),
            UpdaterError::NotOstreeSystem(m) => UpdaterError::NotOstreeSystem(join(m)),
            UpdaterError::Io(m) => UpdaterError::Io(join(m)),
        }
    }
}

impl From<std::io::Error> for UpdaterError {
    fn from(e: std::io::Error) -> Self {
        UpdaterError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::BlockReason;

    #[test]
    fn test_names_and_codes_are_distinct() {
        let all = vec![
            UpdaterError::WrongState(String::new()),
            UpdaterError::LiveBoot(String::new()),
            UpdaterError::Network(String::new()),
            UpdaterError::NotFound(String::new()),
            UpdaterError::Corrupt(String::new()),
            UpdaterError::CheckpointBlock(CheckpointBlock::new(BlockReason::NotSpecified, "")),
            UpdaterError::Cancelled(String::new()),
            UpdaterError::Deploy(String::new()),
            UpdaterError::InvalidConfig(String::new()),
            UpdaterError::WrongConfiguration(String::new()),
            UpdaterError::NotOstreeSystem(String::new()),
            UpdaterError::Io(String::new()),
        ];
        let mut names: Vec<_> = all.iter().map(|e| e.name()).collect();
        let mut codes: Vec<_> = all.iter().map(|e| e.code()).collect();
        names.sort();
        names.dedup();
        codes.sort();
        codes.dedup();
        assert_eq!(names.len(), all.len());
        assert_eq!(codes.len(), all.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_annotate_preserves_variant() {
        let err = UpdaterError::Network("timeout".to_string()).annotate("lan: refused");
        assert_eq!(err.name(), "NETWORK");
        assert_eq!(err.to_string(), "timeout; lan: refused");
    }

    #[test]
    fn test_annotate_checkpoint_block() {
        let err = UpdaterError::CheckpointBlock(CheckpointBlock::new(
            BlockReason::PolicyForbids,
            "blocked",
        ))
        .annotate("more");
        match err {
            UpdaterError::CheckpointBlock(block) => {
                assert_eq!(block.reason, BlockReason::PolicyForbids);
                assert_eq!(block.detail, "blocked; more");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_only_network_is_transient() {
        assert!(UpdaterError::Network("x".into()).is_transient());
        assert!(!UpdaterError::Corrupt("x".into()).is_transient());
        assert!(!UpdaterError::cancelled().is_transient());
        assert!(UpdaterError::cancelled().is_cancelled());
    }
}
