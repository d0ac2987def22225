//! Live (installer) image detection.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::FORCE_LIVE_BOOT_ENV_VAR;

/// Kernel command-line token set on live images.
pub const LIVE_BOOT_CMDLINE_TOKEN: &str = "endless.live_boot";

/// Returns true when running from a live image.
///
/// A non-empty `EU_FORCE_LIVE_BOOT` wins over the command line. An
/// unreadable command line counts as not live.
pub fn is_live_boot(cmdline_path: &Path) -> bool {
    if std::env::var_os(FORCE_LIVE_BOOT_ENV_VAR).is_some_and(|v| !v.is_empty()) {
        debug!("Live boot forced by {}", FORCE_LIVE_BOOT_ENV_VAR);
        return true;
    }

    match fs::read_to_string(cmdline_path) {
        Ok(cmdline) => cmdline_is_live(&cmdline),
        Err(e) => {
            debug!(path = %cmdline_path.display(), error = %e, "Failed to read kernel command line");
            false
        }
    }
}

fn cmdline_is_live(cmdline: &str) -> bool {
    cmdline
        .split_whitespace()
        .any(|arg| arg == LIVE_BOOT_CMDLINE_TOKEN || arg.starts_with("endless.live_boot="))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_cmdline_token() {
        assert!(cmdline_is_live("quiet endless.live_boot splash"));
        assert!(cmdline_is_live("endless.live_boot=1\n"));
        assert!(!cmdline_is_live("quiet endless.live_bootx splash"));
        assert!(!cmdline_is_live(""));
    }

    #[test]
    #[serial]
    fn test_reads_cmdline_file() {
        std::env::remove_var(FORCE_LIVE_BOOT_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmdline");
        assert!(!is_live_boot(&path));
        std::fs::write(&path, "ro endless.live_boot\n").unwrap();
        assert!(is_live_boot(&path));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmdline");
        std::env::set_var(FORCE_LIVE_BOOT_ENV_VAR, "");
        assert!(!is_live_boot(&path));
        std::env::set_var(FORCE_LIVE_BOOT_ENV_VAR, "1");
        assert!(is_live_boot(&path));
        std::env::remove_var(FORCE_LIVE_BOOT_ENV_VAR);
    }
}
