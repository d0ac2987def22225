use super::*;
use crate::config::{Config, SysrootSettings};
use tempfile::TempDir;

/// An updater in the error state: the sysroot has no booted deployment.
fn service() -> (TempDir, UpdaterService) {
    let dir = TempDir::new().unwrap();
    let config = Config {
        sysroot: SysrootSettings {
            path: dir.path().join("sysroot"),
            cmdline_path: dir.path().join("cmdline"),
            deployment_fallback: false,
            osname: None,
        },
        ..Config::for_test()
    };
    let updater = Updater::spawn(config);
    (dir, UpdaterService::new(updater))
}

fn error_name(status: &Status) -> Option<&str> {
    status
        .metadata()
        .get(ERROR_NAME_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_get_properties_reports_error_state() {
    let (_dir, service) = service();
    let props = service
        .get_properties(Request::new(PropertiesRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(props.updater_state(), pb::UpdaterState::Error);
    assert!(props.error_code > 0);
    assert!(!props.error_name.is_empty());
}

#[tokio::test]
async fn test_wrong_state_is_failed_precondition() {
    let (_dir, service) = service();
    let status = service.fetch(Request::new(FetchRequest {})).await.unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(error_name(&status), Some("WRONG_STATE"));
    assert_eq!(status.message(), "Can't call Fetch() while in state Error");
}

#[tokio::test]
async fn test_poll_volume_requires_absolute_path() {
    let (_dir, service) = service();
    let status = service
        .poll_volume(Request::new(PollVolumeRequest {
            path: "media/usb".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_cancel_returns_current_state() {
    let (_dir, service) = service();
    let response = service
        .cancel(Request::new(CancelRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.state, pb::UpdaterState::Error as i32);
}

#[tokio::test]
async fn test_watch_properties_starts_with_snapshot() {
    let (_dir, service) = service();
    let mut stream = service
        .watch_properties(Request::new(PropertiesRequest {}))
        .await
        .unwrap()
        .into_inner();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.updater_state(), pb::UpdaterState::Error);
}

#[test]
fn test_status_mapping_carries_error_name() {
    let status = to_status(UpdaterError::live_boot());
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert_eq!(error_name(&status), Some("LIVE_BOOT"));

    let status = to_status(UpdaterError::Network("timed out".to_string()));
    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), "timed out");
}

#[test]
fn test_properties_conversion() {
    let props = Properties {
        state: UpdaterState::UpdateAvailable,
        update_id: "abc".to_string(),
        download_size: -1,
        offline_only: true,
        ..Default::default()
    };
    let proto = properties_to_proto(&props);
    assert_eq!(proto.updater_state(), pb::UpdaterState::UpdateAvailable);
    assert_eq!(proto.update_id, "abc");
    assert_eq!(proto.download_size, -1);
    assert!(proto.offline_only);
}
