use super::*;
use crate::refspec::Refspec;
use crate::repo::summary::Summary;
use crate::repo::CommitSpec;
use axum::body::Body;
use http::Request;
use std::fs;
use tempfile::TempDir;
use tower::ServiceExt;

struct Fixture {
    _dir: TempDir,
    repo: Repo,
    checksum: String,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let repo = Repo::create(&dir.path().join("repo"), RepoMode::ArchiveZ2).unwrap();
    repo.add_remote("eos", "http://example.com/ostree", Some("com.example.Os"))
        .unwrap();
    let tree = dir.path().join("tree");
    fs::create_dir_all(&tree).unwrap();
    fs::write(tree.join("file"), "contents").unwrap();
    let checksum = repo
        .commit_directory(
            &tree,
            CommitSpec {
                timestamp: 100,
                ..Default::default()
            },
        )
        .unwrap();
    repo.set_ref(&Refspec::parse("eos:os/eos/amd64/eos3").unwrap(), Some(&checksum))
        .unwrap();
    Fixture {
        _dir: dir,
        repo,
        checksum,
    }
}

fn server(fx: &Fixture, root_path: &str) -> RepoServer {
    RepoServer::new(vec![ServedRepository::new(fx.repo.clone(), root_path, "eos")])
}

async fn get(server: &RepoServer, uri: &str) -> (StatusCode, Bytes) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();
    (status, body)
}

#[tokio::test]
async fn test_objects_are_served_as_is() {
    let fx = fixture();
    let server = server(&fx, "");
    let name = crate::repo::ObjectName::new(crate::repo::ObjectType::Commit, fx.checksum.clone());

    let (status, body) = get(&server, &format!("/{}", name.relative_path())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), fx.repo.read_object(&name).unwrap().as_slice());
}

#[tokio::test]
async fn test_config_hides_remotes() {
    let fx = fixture();
    let server = server(&fx, "");
    let (status, body) = get(&server, "/config").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("mode=archive-z2"));
    assert!(text.contains("repo_version=1"));
    assert!(!text.contains("remote"));
}

#[tokio::test]
async fn test_summary_is_regenerated_when_absent() {
    let fx = fixture();
    let server = server(&fx, "");
    assert!(fx.repo.read_summary().unwrap().is_none());

    let (status, body) = get(&server, "/summary").await;
    assert_eq!(status, StatusCode::OK);
    let summary = Summary::from_bytes(&body).unwrap();
    assert_eq!(
        summary.lookup("os/eos/amd64/eos3").map(|r| r.checksum.as_str()),
        Some(fx.checksum.as_str())
    );

    let (status, _) = get(&server, "/summary.sig").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_heads_fall_back_to_served_remote() {
    let fx = fixture();
    let server = server(&fx, "");
    let (status, body) = get(&server, "/refs/heads/os/eos/amd64/eos3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body.to_vec()).unwrap().trim(), fx.checksum);

    let (status, _) = get(&server, "/refs/heads/os/eos/amd64/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&server, "/refs/heads/").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_remote_refs_are_not_exposed_directly() {
    let fx = fixture();
    let server = server(&fx, "");
    let (status, _) = get(&server, "/refs/remotes/eos/os/eos/amd64/eos3").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_parent_components_are_forbidden() {
    let fx = fixture();
    let server = server(&fx, "");
    let (status, _) = get(&server, "/objects/../config").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_repository_prefix() {
    let fx = fixture();
    let server = server(&fx, "/1");
    let (status, _) = get(&server, "/1/config").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&server, "/config").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&server, "/10/config").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_disconnected_server_is_unavailable() {
    let fx = fixture();
    let server = server(&fx, "");
    server.disconnect();
    assert!(server.is_disconnected());
    let (status, _) = get(&server, "/config").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_requests_are_counted() {
    let fx = fixture();
    let server = server(&fx, "");
    let stats = server.stats();
    assert_eq!(stats.last_request_time(), 0);
    get(&server, "/config").await;
    assert_eq!(stats.pending_requests(), 0);
    assert!(stats.last_request_time() > 0);
}

#[tokio::test]
async fn test_objects_are_cacheable_and_refs_are_not() {
    let fx = fixture();
    let server = server(&fx, "");
    let name = crate::repo::ObjectName::new(crate::repo::ObjectType::Commit, fx.checksum.clone());

    let req = Request::builder()
        .uri(format!("/{}", name.relative_path()))
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(resp.headers()[header::CACHE_CONTROL], IMMUTABLE_CACHE_CONTROL);

    let req = Request::builder()
        .uri("/refs/heads/os/eos/amd64/eos3")
        .body(Body::empty())
        .unwrap();
    let resp = server.router().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CACHE_CONTROL], MUTABLE_CACHE_CONTROL);
}
