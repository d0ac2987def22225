//! Shared fixtures for integration tests.
//!
//! An origin repository served over HTTP on an ephemeral port, a sysroot
//! booted from a commit of that origin, and a daemon serving the updater
//! over gRPC.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use eos_updater::config::{Config, FinderSettings, SysrootSettings};
use eos_updater::facade::UpdaterService;
use eos_updater::refspec::Refspec;
use eos_updater::repo::{CommitSpec, Repo, RepoMode};
use eos_updater::server::{RepoServer, ServedRepository};
use eos_updater::sysroot::Sysroot;
use eos_updater::Updater;
use eos_updater_client::UpdaterClient;

/// Branch every fixture tracks.
pub const REF: &str = "os/eos/amd64/eos3";
/// Origin refspec of the booted deployment.
pub const ORIGIN: &str = "eos:os/eos/amd64/eos3";

/// Generous bound on a single operation.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Commit a small tree carrying `version` into `repo`.
///
/// Identical arguments give identical checksums in any repository.
pub fn commit(scratch: &Path, repo: &Repo, name: &str, timestamp: u64, version: &str) -> String {
    let tree = scratch.join(format!("tree-{}", name));
    fs::create_dir_all(tree.join("etc")).unwrap();
    fs::write(tree.join("etc/os-release"), format!("VERSION={}\n", version)).unwrap();
    fs::write(tree.join("payload"), name.repeat(256)).unwrap();
    repo.commit_directory(
        &tree,
        CommitSpec {
            timestamp,
            subject: format!("Release {}", version),
            body: format!("Changes in {}", version),
            metadata: BTreeMap::from([("version".to_string(), json!(version))]),
            ..Default::default()
        },
    )
    .unwrap()
}

/// An archive repository served by [`RepoServer`] on 127.0.0.1.
pub struct Origin {
    pub dir: TempDir,
    pub repo: Repo,
    pub url: String,
    pub server: RepoServer,
    shutdown: CancellationToken,
}

impl Origin {
    pub async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let repo = Repo::create(&dir.path().join("repo"), RepoMode::ArchiveZ2).unwrap();
        let server = RepoServer::new(vec![ServedRepository::new(repo.clone(), "", "eos")]);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let serving = server.clone();
        tokio::spawn(async move {
            let _ = serving
                .serve(listener, async move { signal.cancelled().await })
                .await;
        });

        Self {
            dir,
            repo,
            url,
            server,
            shutdown,
        }
    }

    /// Commit onto the tracked branch and republish the summary.
    pub fn publish(&self, name: &str, timestamp: u64, version: &str) -> String {
        let checksum = commit(self.dir.path(), &self.repo, name, timestamp, version);
        self.repo
            .set_ref(&Refspec::parse(REF).unwrap(), Some(&checksum))
            .unwrap();
        self.repo.regenerate_summary(None).unwrap();
        checksum
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A sysroot booted from release 1.0.0 of the tracked branch.
pub struct System {
    pub dir: TempDir,
    pub config: Config,
    pub booted: String,
}

impl System {
    /// Boot a system whose `eos` remote points at `remote_url`.
    pub fn booted(remote_url: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = SysrootSettings {
            path: dir.path().join("sysroot"),
            cmdline_path: dir.path().join("cmdline"),
            deployment_fallback: false,
            osname: None,
        };
        let mut sysroot = Sysroot::create(&settings).unwrap();
        let repo = sysroot.repo().unwrap();
        repo.add_remote("eos", remote_url, None).unwrap();
        let booted = commit(dir.path(), &repo, "v1", 1, "1.0.0");
        let origin = Refspec::parse(ORIGIN).unwrap();
        repo.set_ref(&origin, Some(&booted)).unwrap();
        let deployment = sysroot
            .deploy("eos", &booted, &origin, None, &CancellationToken::new())
            .unwrap();
        sysroot.simple_write_deployment(&deployment, None).unwrap();
        fs::write(
            dir.path().join("cmdline"),
            format!(
                "quiet ostree=/ostree/deploy/eos/deploy/{}\n",
                deployment.dir_name()
            ),
        )
        .unwrap();

        let download_config = dir.path().join("eos-updater.conf");
        fs::write(&download_config, "[Download]\nOrder=main;\n").unwrap();

        Self {
            config: Config {
                sysroot: settings,
                finders: FinderSettings {
                    timeout_secs: 10,
                    retry_attempts: 1,
                    retry_base_ms: 10,
                },
                download_config: Some(download_config),
                ..Config::for_test()
            },
            dir,
            booted,
        }
    }

    pub fn sysroot(&self) -> Sysroot {
        let mut sysroot = Sysroot::new(&self.config.sysroot);
        sysroot.load().unwrap();
        sysroot
    }
}

/// The updater behind its gRPC façade on an ephemeral port.
pub struct Daemon {
    pub updater: Updater,
    pub client: UpdaterClient,
    pub endpoint: String,
    shutdown: CancellationToken,
}

impl Daemon {
    pub async fn start(config: Config) -> Self {
        let updater = Updater::spawn(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let service = UpdaterService::new(updater.clone()).into_server();
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    signal.cancelled().await
                })
                .await;
        });

        let client = UpdaterClient::connect(&endpoint).await.unwrap();
        Self {
            updater,
            client,
            endpoint,
            shutdown,
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
