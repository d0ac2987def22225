//! Avahi service files announcing this machine as an update source.
//!
//! Two files are managed in the services directory: the legacy
//! `eos-updater.service` (`_eos_updater._tcp`, text records) and one
//! `eos-ostree-updater-<index>.service` per served repository
//! (`_ostree_repo._tcp`, base64-encoded binary records).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, info};

use super::txt::{
    encode_txt, legacy_txt, Advertisement, TxtOptions, TxtRecord, LEGACY_SERVICE_TYPE,
    OSTREE_SERVICE_TYPE,
};
use crate::config::AVAHI_SERVICES_DIR_ENV_VAR;
use crate::error::{Result, UpdaterError};

/// Port the repository server listens on when advertised.
pub const AVAHI_PORT: u16 = 43381;
/// Default Avahi services directory.
pub const DEFAULT_SERVICES_DIR: &str = "/etc/avahi/services";
/// File name of the legacy service.
pub const LEGACY_SERVICE_FILE: &str = "eos-updater.service";

/// Services directory, honouring the test override.
pub fn services_dir() -> PathBuf {
    std::env::var_os(AVAHI_SERVICES_DIR_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICES_DIR))
}

/// File name of the service for repository `index`.
pub fn ostree_service_file(index: u16) -> String {
    format!("eos-ostree-updater-{}.service", index)
}

/// Write the legacy service advertising `ostree_path` at
/// `head_commit_timestamp`.
pub fn generate_legacy(dir: &Path, ostree_path: &str, head_commit_timestamp: u64) -> Result<PathBuf> {
    let records: Vec<String> = legacy_txt(ostree_path, head_commit_timestamp)
        .into_iter()
        .map(|(key, value)| {
            let value = String::from_utf8_lossy(&value).into_owned();
            format!("    <txt-record>{}={}</txt-record>\n", escape(&key), escape(&value))
        })
        .collect();

    let contents = service_group("EOS update service on %h", LEGACY_SERVICE_TYPE, AVAHI_PORT, &records);
    let path = dir.join(LEGACY_SERVICE_FILE);
    write_atomic(&path, contents.as_bytes())?;
    info!(path = %path.display(), ostree_path = %ostree_path, "Wrote legacy service file");
    Ok(path)
}

/// Write the `_ostree_repo._tcp` service for `ad`.
pub fn generate_ostree(dir: &Path, ad: &Advertisement, options: &TxtOptions) -> Result<PathBuf> {
    let encoded = encode_txt(ad, AVAHI_PORT, options)?;
    let records: Vec<String> = encoded.iter().map(binary_record).collect();

    let contents = service_group("EOS OSTree update service on %h", OSTREE_SERVICE_TYPE, AVAHI_PORT, &records);
    let path = dir.join(ostree_service_file(ad.repo_index));
    write_atomic(&path, contents.as_bytes())?;
    info!(
        path = %path.display(),
        refs = ad.refs.len(),
        summary_timestamp = ad.summary_timestamp,
        "Wrote OSTree service file"
    );
    Ok(path)
}

/// Remove the legacy service file; a missing file is not an error.
pub fn delete_legacy(dir: &Path) -> Result<()> {
    remove(&dir.join(LEGACY_SERVICE_FILE))
}

/// Remove the service file of repository `index`.
pub fn delete_ostree(dir: &Path, index: u16) -> Result<()> {
    remove(&dir.join(ostree_service_file(index)))
}

fn binary_record((key, value): &TxtRecord) -> String {
    format!(
        "    <txt-record value-format=\"binary-base64\">{}={}</txt-record>\n",
        escape(key),
        STANDARD.encode(value)
    )
}

fn service_group(name: &str, service_type: &str, port: u16, records: &[String]) -> String {
    format!(
        "<service-group>\n  <name replace-wildcards=\"yes\">{}</name>\n  <service>\n    <type>{}</type>\n    <port>{}</port>\n{}  </service>\n</service-group>\n",
        escape(name),
        escape(service_type),
        port,
        records.concat()
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = dest.with_extension(format!("tmp-{}", std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, dest).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        UpdaterError::from(e)
    })
}

fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed service file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
