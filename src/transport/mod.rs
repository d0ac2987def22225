//! Façade transport.
//!
//! Supports:
//! - TCP: loopback by default
//! - UDS: a socket under `/run/eos-updater`

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::service::Routes;
use tonic::transport::server::Router;
use tower::Layer;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Socket name of the daemon under the UDS base path.
pub const SERVICE_NAME: &str = "eos-updater";

/// Transport type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Tcp,
    Uds,
}

/// Transport configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    pub tcp: TcpConfig,
    pub uds: UdsConfig,
}

impl TransportConfig {
    /// Address a client should connect to, in the form the client library
    /// accepts (`http://host:port` or a socket path).
    pub fn client_endpoint(&self) -> String {
        match self.transport_type {
            TransportType::Tcp => {
                let host = match self.tcp.host.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    host => host,
                };
                format!("http://{}:{}", host, self.tcp.port)
            }
            TransportType::Uds => self.uds.socket_path(SERVICE_NAME).display().to_string(),
        }
    }
}

/// TCP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50151,
        }
    }
}

impl TcpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// UDS transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdsConfig {
    /// Directory holding the socket.
    pub base_path: PathBuf,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/run/eos-updater"),
        }
    }
}

impl UdsConfig {
    pub fn socket_path(&self, service_name: &str) -> PathBuf {
        self.base_path.join(format!("{}.sock", service_name))
    }
}

/// Owns the daemon socket file and unlinks it when dropped.
pub struct SocketFile {
    path: PathBuf,
}

impl SocketFile {
    /// Make `path` bindable: create its directory and unlink a leftover
    /// socket from a previous run.
    pub fn claim(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => info!(path = %path.display(), "Removed leftover socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove socket"),
        }
    }
}

/// Serve a gRPC router on the configured transport until `signal` resolves.
pub async fn serve_with_transport_and_shutdown<L, ResBody, F>(
    router: Router<L>,
    config: &TransportConfig,
    signal: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    L: Layer<Routes> + Clone,
    L::Service: Service<http::Request<tonic::body::BoxBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    <L::Service as Service<http::Request<tonic::body::BoxBody>>>::Future: Send + 'static,
    <L::Service as Service<http::Request<tonic::body::BoxBody>>>::Error:
        Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    ResBody: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    F: Future<Output = ()> + Send,
{
    match config.transport_type {
        TransportType::Tcp => {
            let addr: SocketAddr = config.tcp.addr().parse()?;
            info!(address = %addr, transport = "tcp", "Updater listening");
            router.serve_with_shutdown(addr, signal).await?;
        }
        TransportType::Uds => {
            let socket_path = config.uds.socket_path(SERVICE_NAME);
            let _socket = SocketFile::claim(&socket_path)?;
            let stream = UnixListenerStream::new(UnixListener::bind(&socket_path)?);
            info!(path = %socket_path.display(), transport = "uds", "Updater listening");
            router.serve_with_incoming_shutdown(stream, signal).await?;
        }
    }
    Ok(())
}

/// Trace layer opening one span per remote call.
///
/// With the `otel` feature the W3C `traceparent` header becomes the span's
/// parent.
pub fn grpc_trace_layer() -> TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::GrpcErrorsAsFailures>,
    impl Fn(&http::Request<tonic::body::BoxBody>) -> tracing::Span + Clone,
> {
    TraceLayer::new_for_grpc().make_span_with(|request: &http::Request<tonic::body::BoxBody>| {
        let path = request.uri().path();
        let span = tracing::info_span!("grpc", %path);

        #[cfg(feature = "otel")]
        {
            extract_trace_context(request.headers(), &span);
        }

        span
    })
}

#[cfg(feature = "otel")]
fn extract_trace_context(headers: &http::HeaderMap, span: &tracing::Span) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let parent_cx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    });
    span.set_parent(parent_cx);
}

#[cfg(feature = "otel")]
struct HeaderExtractor<'a>(&'a http::HeaderMap);

#[cfg(feature = "otel")]
impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.transport_type, TransportType::Tcp);
        assert_eq!(config.tcp.addr(), "127.0.0.1:50151");
        assert_eq!(config.client_endpoint(), "http://127.0.0.1:50151");
    }

    #[test]
    fn test_wildcard_host_connects_over_loopback() {
        let config = TransportConfig {
            tcp: TcpConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            ..Default::default()
        };
        assert_eq!(config.client_endpoint(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_uds_socket_path() {
        let config = TransportConfig {
            transport_type: TransportType::Uds,
            uds: UdsConfig {
                base_path: PathBuf::from("/tmp/test"),
            },
            ..Default::default()
        };
        assert_eq!(config.client_endpoint(), "/tmp/test/eos-updater.sock");
    }

    #[test]
    fn test_socket_file_removes_leftover_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("eos-updater.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "leftover").unwrap();

        let socket = SocketFile::claim(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(socket.path(), path);
        std::fs::write(&path, "bound").unwrap();
        drop(socket);
        assert!(!path.exists());
    }

    #[test]
    fn test_socket_file_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.sock");
        let _socket = SocketFile::claim(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());
    }
}
