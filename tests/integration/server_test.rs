//! The repository server over a real socket.

use std::time::Duration;

use reqwest::StatusCode;
use tokio::net::TcpListener;

use crate::common::{Origin, REF};
use eos_updater::repo::Summary;
use eos_updater::server::{RepoServer, ServedRepository};

#[tokio::test]
async fn test_serves_refs_and_summary_over_http() {
    let origin = Origin::start().await;
    let checksum = origin.publish("v1", 1, "1.0.0");
    let http = reqwest::Client::new();

    let resp = http
        .get(format!("{}/refs/heads/{}", origin.url, REF))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap().trim(), checksum);

    let resp = http
        .get(format!("{}/summary", origin.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let summary = Summary::from_bytes(&resp.bytes().await.unwrap()).unwrap();
    assert_eq!(summary.refs[REF].checksum, checksum);

    let resp = http
        .get(format!("{}/refs/heads/os/eos/amd64/missing", origin.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_exits_after_idle_timeout() {
    let origin = Origin::start().await;
    origin.publish("v1", 1, "1.0.0");
    let server = RepoServer::new(vec![ServedRepository::new(origin.repo.clone(), "", "eos")]);
    let stats = server.stats();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let idle = Duration::from_millis(300);
    let serving = tokio::spawn(server.serve(listener, async move {
        stats.wait_idle(idle).await;
    }));

    let resp = reqwest::get(format!("{}/config", url)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(!resp.bytes().await.unwrap().is_empty());

    tokio::time::timeout(Duration::from_secs(10), serving)
        .await
        .expect("server did not stop when idle")
        .unwrap()
        .unwrap();
}
