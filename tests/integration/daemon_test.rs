//! The updater driven through its gRPC façade with the typed client.

use std::time::Duration;

use tokio_stream::StreamExt;
use tonic::Code;

use crate::common::{Daemon, Origin, System, SETTLE_TIMEOUT};
use eos_updater::proto::updater_client::UpdaterClient;
use eos_updater::proto::{PollVolumeRequest, UpdaterState};

#[tokio::test]
#[serial_test::serial]
async fn test_update_cycle_over_grpc() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    origin.publish("v1", 1, "1.0.0");
    let update = origin.publish("v2", 2, "2.0.0");
    let daemon = Daemon::start(system.config.clone()).await;
    let client = &daemon.client;

    client.poll().await.unwrap();
    let props = client
        .wait_while(UpdaterState::Polling, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(props.updater_state(), UpdaterState::UpdateAvailable, "{:?}", props);
    assert_eq!(props.update_id, update);
    assert_eq!(props.version, "2.0.0");

    client.fetch().await.unwrap();
    let props = client
        .wait_while(UpdaterState::Fetching, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(props.updater_state(), UpdaterState::UpdateReady, "{:?}", props);

    client.apply().await.unwrap();
    let props = client
        .wait_while(UpdaterState::ApplyingUpdate, SETTLE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(props.updater_state(), UpdaterState::UpdateApplied, "{:?}", props);
    assert_eq!(system.sysroot().deployments()[0].checksum, update);
}

#[tokio::test]
#[serial_test::serial]
async fn test_wrong_state_is_reported_with_its_name() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    let daemon = Daemon::start(system.config.clone()).await;

    let err = daemon.client.apply().await.unwrap_err();
    assert_eq!(err.code(), Some(Code::FailedPrecondition));
    assert!(err.is_wrong_state());
    assert_eq!(err.message(), "Can't call Apply() while in state Ready");
    assert_eq!(daemon.updater.state(), eos_updater::UpdaterState::Ready);
}

#[tokio::test]
#[serial_test::serial]
async fn test_relative_volume_path_is_rejected_by_the_daemon() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    let daemon = Daemon::start(system.config.clone()).await;

    // Bypass the client-side check to reach the daemon.
    let mut raw = UpdaterClient::connect(daemon.endpoint.clone()).await.unwrap();
    let status = raw
        .poll_volume(PollVolumeRequest {
            path: "media/usb".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
#[serial_test::serial]
async fn test_watch_streams_state_changes() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    origin.publish("v1", 1, "1.0.0");
    let daemon = Daemon::start(system.config.clone()).await;

    let mut stream = daemon.client.watch().await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.updater_state(), UpdaterState::Ready);

    daemon.client.poll().await.unwrap();
    let mut seen = Vec::new();
    let collect = async {
        while let Some(props) = stream.next().await {
            let state = props.unwrap().updater_state();
            seen.push(state);
            if !matches!(state, UpdaterState::Polling) {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), collect)
        .await
        .expect("no settled state on the stream");
    assert_eq!(seen.last(), Some(&UpdaterState::Ready));
}

#[tokio::test]
#[serial_test::serial]
async fn test_cancel_when_idle_reports_state() {
    let origin = Origin::start().await;
    let system = System::booted(&origin.url);
    let daemon = Daemon::start(system.config.clone()).await;

    assert_eq!(daemon.client.cancel().await.unwrap(), UpdaterState::Ready);
}
