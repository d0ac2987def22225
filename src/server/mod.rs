//! Repository HTTP server.
//!
//! Serves local repositories to peers. Each configured repository is
//! mounted under its own prefix (`""` for repository 0, `/N` otherwise):
//!
//! - `/objects/**`, `/deltas/**` and `/extensions/**` are served as-is
//! - `/config` is a synthesized archive-mode config exposing no remotes
//! - `/summary` and `/summary.sig` are regenerated when absent
//! - `/refs/heads/X` falls back to `refs/remotes/<served remote>/X`
//!
//! Any path containing `..` is refused with 403. Once disconnected, every
//! request gets 503.

mod stats;

pub use stats::{RequestGuard, RequestStats};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::update_server::RepositoryConfig;
use crate::repo::config::{RepoConfig, RepoMode};
use crate::repo::summary::{SUMMARY_FILE, SUMMARY_SIG_FILE};
use crate::repo::{Repo, RepoError};

const REFS_HEADS_PREFIX: &str = "/refs/heads/";
const AS_IS_PREFIXES: [&str; 3] = ["/objects/", "/deltas/", "/extensions/"];

/// One repository mounted on the server.
pub struct ServedRepository {
    repo: Repo,
    root: PathBuf,
    root_path: String,
    served_remote: String,
    config: Bytes,
}

impl ServedRepository {
    /// Serve `repo` under `root_path`, exposing `served_remote`'s refs as heads.
    pub fn new(repo: Repo, root_path: impl Into<String>, served_remote: impl Into<String>) -> Self {
        let config = RepoConfig::new(RepoMode::ArchiveZ2).to_ini_string();
        Self {
            root: repo.path().to_path_buf(),
            repo,
            root_path: root_path.into(),
            served_remote: served_remote.into(),
            config: Bytes::from(config),
        }
    }

    /// Open a configured `[Repository N]`.
    pub fn open(config: &RepositoryConfig) -> Result<Self, RepoError> {
        let repo = Repo::open(&config.path)?;
        Ok(Self::new(repo, config.root_path(), config.remote_name.clone()))
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Strip this repository's prefix, if `path` lies under it.
    fn strip_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(self.root_path.as_str())?;
        if rest.is_empty() || rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    async fn handle(&self, path: &str) -> Response {
        if path.contains("..") {
            return StatusCode::FORBIDDEN.into_response();
        }
        if AS_IS_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return self.serve_file(path).await;
        }
        if path == "/config" {
            return octet_stream(self.config.clone(), MUTABLE_CACHE_CONTROL);
        }
        if path == format!("/{}", SUMMARY_FILE) || path == format!("/{}", SUMMARY_SIG_FILE) {
            return self.handle_summary(path).await;
        }
        if let Some(head) = path.strip_prefix(REFS_HEADS_PREFIX) {
            return self.handle_refs_heads(path, head).await;
        }
        StatusCode::NOT_FOUND.into_response()
    }

    async fn handle_summary(&self, path: &str) -> Response {
        if let Some(response) = self.serve_file_if_exists(path).await {
            return response;
        }
        let repo = self.repo.clone();
        let remote = self.served_remote.clone();
        match tokio::task::spawn_blocking(move || repo.regenerate_summary(Some(&remote))).await {
            Ok(Ok(_)) => self.serve_file(path).await,
            Ok(Err(e)) => {
                debug!(error = %e, "Error regenerating summary");
                StatusCode::NOT_FOUND.into_response()
            }
            Err(e) => {
                warn!(error = %e, "Summary regeneration task failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    async fn handle_refs_heads(&self, path: &str, head: &str) -> Response {
        if head.is_empty() {
            debug!("Invalid request for /refs/heads/");
            return StatusCode::BAD_REQUEST.into_response();
        }
        if let Some(response) = self.serve_file_if_exists(path).await {
            return response;
        }
        let remote_path = format!("/refs/remotes/{}/{}", self.served_remote, head);
        self.serve_file(&remote_path).await
    }

    async fn serve_file(&self, path: &str) -> Response {
        match self.serve_file_if_exists(path).await {
            Some(response) => response,
            None => {
                debug!(path, "File not found");
                StatusCode::NOT_FOUND.into_response()
            }
        }
    }

    /// `None` when there is no regular file at `path` within the root.
    async fn serve_file_if_exists(&self, path: &str) -> Option<Response> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => {}
            _ => return None,
        }
        match tokio::fs::read(&full).await {
            Ok(bytes) => {
                debug!(path = %full.display(), "Serving");
                Some(octet_stream(Bytes::from(bytes), cache_control(path)))
            }
            Err(e) => {
                warn!(path = %full.display(), error = %e, "Failed to load file");
                Some(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let full = self.root.join(relative);
        if full.starts_with(&self.root) {
            Some(full)
        } else {
            debug!(path, root = %self.root.display(), "File not within root");
            None
        }
    }
}

/// Objects and deltas are content-addressed and never change.
const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
const MUTABLE_CACHE_CONTROL: &str = "no-cache";

fn cache_control(path: &str) -> &'static str {
    if path.starts_with("/objects/") || path.starts_with("/deltas/") {
        IMMUTABLE_CACHE_CONTROL
    } else {
        MUTABLE_CACHE_CONTROL
    }
}

fn octet_stream(bytes: Bytes, cache_control: &'static str) -> Response {
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static(cache_control)),
        ],
        bytes,
    )
        .into_response()
}

// ============================================================================
// Server
// ============================================================================

struct ServerState {
    repositories: Vec<ServedRepository>,
    stats: Arc<RequestStats>,
    disconnected: CancellationToken,
}

/// A set of repositories behind one listener.
#[derive(Clone)]
pub struct RepoServer {
    state: Arc<ServerState>,
}

impl RepoServer {
    pub fn new(mut repositories: Vec<ServedRepository>) -> Self {
        // Longest prefix first so `/1/...` is not claimed by repository 0.
        repositories.sort_by(|a, b| b.root_path.len().cmp(&a.root_path.len()));
        Self {
            state: Arc::new(ServerState {
                repositories,
                stats: RequestStats::new(),
                disconnected: CancellationToken::new(),
            }),
        }
    }

    /// Open every configured repository.
    pub fn from_config(repositories: &[RepositoryConfig]) -> Result<Self, RepoError> {
        let served = repositories
            .iter()
            .map(ServedRepository::open)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(served))
    }

    pub fn stats(&self) -> Arc<RequestStats> {
        Arc::clone(&self.state.stats)
    }

    /// Stop serving; subsequent requests get 503.
    pub fn disconnect(&self) {
        self.state.disconnected.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.is_cancelled()
    }

    /// Build the axum router (separated for testing).
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let port = listener.local_addr()?.port();
        info!(
            port,
            repositories = self.state.repositories.len(),
            "Repository server listening"
        );
        let disconnected = self.state.disconnected.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                disconnected.cancel();
            })
            .await
    }
}

async fn handle_request(State(state): State<Arc<ServerState>>, uri: Uri) -> Response {
    let _guard = state.stats.begin();
    let path = uri.path();
    if state.disconnected.is_cancelled() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    debug!(path, "Requested");

    let response = match state
        .repositories
        .iter()
        .find_map(|repo| repo.strip_prefix(path).map(|rest| (repo, rest)))
    {
        Some((repo, rest)) => repo.handle(rest).await,
        None => StatusCode::NOT_FOUND.into_response(),
    };
    debug!(path, status = %response.status(), "Returning status");
    response
}

#[cfg(test)]
mod tests;
