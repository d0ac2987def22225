//! Poll, fetch and apply against an origin served over HTTP.

use std::fs;

use tokio::time::timeout;

use crate::common::{Origin, System, ORIGIN, SETTLE_TIMEOUT};
use eos_updater::repo::summary::{SUMMARY_FILE, SUMMARY_SIG_FILE};
use eos_updater::{Properties, Updater, UpdaterState};

async fn settle(updater: &Updater) -> Properties {
    timeout(SETTLE_TIMEOUT, updater.wait_for(|s| !s.is_busy()))
        .await
        .expect("operation did not settle")
        .unwrap()
}

#[tokio::test]
#[serial_test::serial]
async fn test_origin_update_cycle() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    let booted = origin.publish("v1", 1, "1.0.0");
    assert_eq!(booted, system.booted);
    let update = origin.publish("v2", 2, "2.0.0");

    let updater = Updater::spawn(system.config.clone());
    assert_eq!(updater.state(), UpdaterState::Ready);

    updater.poll().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::UpdateAvailable, "{:?}", props);
    assert_eq!(props.update_id, update);
    assert_eq!(props.update_refspec, ORIGIN);
    assert_eq!(props.original_refspec, ORIGIN);
    assert_eq!(props.version, "2.0.0");
    assert_eq!(props.update_label, "Release 2.0.0");
    assert!(props.update_is_user_visible);
    assert!(!props.offline_only);

    updater.fetch().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::UpdateReady, "{:?}", props);
    assert!(props.downloaded_bytes > 0);

    updater.apply().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::UpdateApplied, "{:?}", props);

    let sysroot = system.sysroot();
    assert_eq!(sysroot.deployments()[0].checksum, update);
    assert_eq!(sysroot.booted_deployment().unwrap().checksum, system.booted);
    assert!(origin.server.stats().last_request_time() > 0);
}

#[tokio::test]
#[serial_test::serial]
async fn test_poll_without_new_commit_is_ready() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    origin.publish("v1", 1, "1.0.0");

    let updater = Updater::spawn(system.config.clone());
    updater.poll().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::Ready, "{:?}", props);
    assert_eq!(props.update_id, "");
    assert_eq!(props.error_code, 0);
}

#[tokio::test]
#[serial_test::serial]
async fn test_summary_is_regenerated_by_the_server() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    origin.publish("v1", 1, "1.0.0");
    let update = origin.publish("v2", 2, "2.0.0");
    fs::remove_file(origin.repo.path().join(SUMMARY_FILE)).unwrap();
    let _ = fs::remove_file(origin.repo.path().join(SUMMARY_SIG_FILE));

    let updater = Updater::spawn(system.config.clone());
    updater.poll().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::UpdateAvailable, "{:?}", props);
    assert_eq!(props.update_id, update);
    assert!(origin.repo.path().join(SUMMARY_FILE).exists());
}

#[tokio::test]
#[serial_test::serial]
async fn test_unreachable_origin_is_a_network_error() {
    let system = System::booted("http://127.0.0.1:9/ostree");

    let updater = Updater::spawn(system.config.clone());
    updater.poll().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::Error, "{:?}", props);
    assert_eq!(props.error_name, "NETWORK");
    assert_ne!(props.error_code, 0);

    // Error is not terminal.
    updater.poll().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::Error);
}

#[tokio::test]
#[serial_test::serial]
async fn test_disconnected_origin_fails_the_poll() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    origin.publish("v1", 1, "1.0.0");
    origin.publish("v2", 2, "2.0.0");
    origin.server.disconnect();

    let updater = Updater::spawn(system.config.clone());
    updater.poll().await.unwrap();
    let props = settle(&updater).await;
    assert_eq!(props.state, UpdaterState::Error, "{:?}", props);
    assert_eq!(props.error_name, "NETWORK");
    assert_eq!(props.update_id, "");
}
