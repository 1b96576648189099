//! Reverse proxy dispatcher
//! Routes inbound HTTP/HTTPS connections to local ports by hostname

use crate::certificate::CertificateProvider;
use crate::error::{Error, Result};
use crate::pages::ErrorPage;
use crate::registry::{DomainEntry, DomainRegistry};
use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Backends always live on the loopback interface
const BACKEND_HOST: &str = "127.0.0.1";

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type BackendClient = Client<HttpConnector, ProxyBody>;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind_address: IpAddr,
    /// How long in-flight connections may drain after `stop()`
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// State shared by every connection task
struct Shared {
    registry: Arc<dyn DomainRegistry>,
    certificates: Arc<CertificateProvider>,
    client: BackendClient,
    shutdown_grace: Duration,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    http_task: JoinHandle<()>,
    https_task: JoinHandle<()>,
    http_addr: SocketAddr,
    https_addr: SocketAddr,
}

/// Owns the plaintext and TLS listeners and their lifecycle
pub struct Dispatcher {
    config: DispatcherConfig,
    shared: Arc<Shared>,
    running: Option<Running>,
    last_ports: Option<(u16, u16)>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn DomainRegistry>,
        certificates: Arc<CertificateProvider>,
        config: DispatcherConfig,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        let shared = Arc::new(Shared {
            registry,
            certificates,
            client,
            shutdown_grace: config.shutdown_grace,
        });

        Self {
            config,
            shared,
            running: None,
            last_ports: None,
        }
    }

    /// Bind both listeners and start serving.
    ///
    /// Fails with [`Error::Bind`] when either port cannot be bound; nothing
    /// keeps running in that case.
    pub async fn start(&mut self, http_port: u16, https_port: u16) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let http_listener = bind(self.config.bind_address, http_port).await?;
        let https_listener = bind(self.config.bind_address, https_port).await?;
        let http_addr = http_listener.local_addr()?;
        let https_addr = https_listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let http_task = tokio::spawn(run_listener(
            http_listener,
            Scheme::Http,
            self.shared.clone(),
            shutdown_rx.clone(),
        ));
        let https_task = tokio::spawn(run_listener(
            https_listener,
            Scheme::Https,
            self.shared.clone(),
            shutdown_rx,
        ));

        info!(%http_addr, %https_addr, "Proxy listening");

        self.last_ports = Some((http_port, https_port));
        self.running = Some(Running {
            shutdown_tx,
            http_task,
            https_task,
            http_addr,
            https_addr,
        });

        Ok(())
    }

    /// Stop accepting, let open connections drain for the grace period and
    /// wait for both listeners to close. Does nothing when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!("Stopping proxy");
        let _ = running.shutdown_tx.send(true);

        for task in [running.http_task, running.https_task] {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }

        info!("Proxy stopped");
    }

    /// Restart on the ports last passed to `start()`
    pub async fn reload(&mut self) -> Result<()> {
        let Some((http_port, https_port)) = self.last_ports else {
            debug!("Reload requested before first start, nothing to do");
            return Ok(());
        };

        self.stop().await;
        self.start(http_port, https_port).await
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound plaintext address while running
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.http_addr)
    }

    /// Bound TLS address while running
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.https_addr)
    }
}

async fn bind(address: IpAddr, port: u16) -> Result<TcpListener> {
    TcpListener::bind(SocketAddr::new(address, port))
        .await
        .map_err(|e| Error::bind(port, e))
}

async fn run_listener(
    listener: TcpListener,
    scheme: Scheme,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote_addr)) => {
                    let shared = shared.clone();
                    let shutdown_rx = shutdown_rx.clone();

                    connections.spawn(async move {
                        let result = match scheme {
                            Scheme::Http => serve_connection(stream, remote_addr, scheme, shared, shutdown_rx).await,
                            Scheme::Https => serve_tls_connection(stream, remote_addr, shared, shutdown_rx).await,
                        };
                        if let Err(e) = result {
                            debug!(%remote_addr, scheme = scheme.as_str(), error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(scheme = scheme.as_str(), error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    drop(listener);

    let grace = shared.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            scheme = scheme.as_str(),
            remaining = connections.len(),
            "Closing connections still open after grace period"
        );
        connections.shutdown().await;
    }

    debug!(scheme = scheme.as_str(), "Listener closed");
}

async fn serve_tls_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor)
        .await
        .map_err(|_| anyhow!("TLS client hello timed out"))??;

    let Some(server_name) = start.client_hello().server_name().map(str::to_ascii_lowercase) else {
        debug!(%remote_addr, "TLS client sent no server name, refusing handshake");
        return Ok(());
    };

    // Certificate generation runs on the blocking pool, other connections
    // keep going while this handshake waits.
    let config = match shared.certificates.server_config_for(&server_name).await {
        Ok(config) => config,
        Err(e @ Error::CertificateUnavailable { .. }) => {
            debug!(%remote_addr, hostname = %server_name, error = %e, "Refusing TLS handshake");
            return Ok(());
        }
        Err(e) => {
            error!(hostname = %server_name, error = %e, "Aborting TLS handshake");
            return Ok(());
        }
    };

    let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, start.into_stream(config))
        .await
        .map_err(|_| anyhow!("TLS handshake timed out"))??;

    serve_connection(tls_stream, remote_addr, Scheme::Https, shared, shutdown_rx).await
}

async fn serve_connection<S>(
    stream: S,
    remote_addr: SocketAddr,
    scheme: Scheme,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let tunnel_shutdown = shutdown_rx.clone();

    let service = service_fn(move |req| {
        let shared = shared.clone();
        let shutdown_rx = tunnel_shutdown.clone();
        async move {
            Ok::<_, Infallible>(handle_request(req, remote_addr, scheme, shared, shutdown_rx).await)
        }
    });

    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            return result.map_err(|e| anyhow!("HTTP service error: {}", e));
        }
        _ = shutdown_rx.changed() => {}
    }

    conn.as_mut().graceful_shutdown();
    conn.await
        .map_err(|e| anyhow!("HTTP service error: {}", e))
}

/// Route one request by its Host header
async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    scheme: Scheme,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
) -> Response<ProxyBody> {
    let Some(hostname) = request_hostname(&req) else {
        debug!(%remote_addr, "Request without Host header");
        return ErrorPage::MissingHost.into_response();
    };

    debug!(%remote_addr, hostname = %hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

    let entry = match shared.registry.lookup(&hostname) {
        Ok(Some(entry)) if entry.proxy_enabled => entry,
        Ok(_) => {
            debug!(hostname = %hostname, "No enabled mapping");
            return ErrorPage::UnmappedHost { hostname }.into_response();
        }
        Err(e) => {
            error!(hostname = %hostname, error = %e, "Registry lookup failed");
            return ErrorPage::Internal.into_response();
        }
    };

    match forward(req, &entry, remote_addr, scheme, &shared, shutdown_rx).await {
        Ok(response) => response,
        Err(e) => {
            error!(hostname = %hostname, port = entry.target_port, error = %e, "Upstream unavailable");
            ErrorPage::UpstreamUnavailable {
                hostname,
                port: entry.target_port,
            }
            .into_response()
        }
    }
}

/// Forward to `127.0.0.1:<target_port>`, streaming both bodies and
/// splicing upgraded connections.
async fn forward(
    mut req: Request<Incoming>,
    entry: &DomainEntry,
    remote_addr: SocketAddr,
    scheme: Scheme,
    shared: &Shared,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<Response<ProxyBody>> {
    let unavailable = |reason: String| Error::UpstreamUnavailable {
        hostname: entry.hostname.clone(),
        port: entry.target_port,
        reason,
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let uri = Uri::builder()
        .scheme("http")
        .authority(format!("{}:{}", BACKEND_HOST, entry.target_port))
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| unavailable(e.to_string()))?;

    let client_upgrade = if is_upgrade_request(&req) {
        Some(hyper::upgrade::on(&mut req))
    } else {
        None
    };

    let original_host = req
        .headers()
        .get(HOST)
        .cloned()
        .or_else(|| HeaderValue::from_str(&entry.hostname).ok());

    let headers = req.headers_mut();
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host.clone());
        headers.insert(HOST, host);
    }
    if let Ok(value) = HeaderValue::from_str(&remote_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    let mut response = shared
        .client
        .request(req.map(|body| body.boxed()))
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(client_upgrade) = client_upgrade {
            let backend_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(
                client_upgrade,
                backend_upgrade,
                entry.hostname.clone(),
                shutdown_rx,
                shared.shutdown_grace,
            ));
        }
    }

    Ok(response.map(|body| body.boxed()))
}

/// Copy bytes both ways between an upgraded client and backend
async fn tunnel(
    client: OnUpgrade,
    backend: OnUpgrade,
    hostname: String,
    mut shutdown_rx: watch::Receiver<bool>,
    grace: Duration,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(hostname = %hostname, error = %e, "Upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client, &mut backend) => match result {
            Ok((sent, received)) => debug!(hostname = %hostname, sent, received, "Upgraded connection closed"),
            Err(e) => debug!(hostname = %hostname, error = %e, "Upgraded connection error"),
        },
        _ = async {
            let _ = shutdown_rx.changed().await;
            tokio::time::sleep(grace).await;
        } => {
            debug!(hostname = %hostname, "Closing upgraded connection on shutdown");
        }
    }
}

/// `Connection: upgrade` together with an `Upgrade` header
fn is_upgrade_request<T>(req: &Request<T>) -> bool {
    let connection_upgrade = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// Hostname the client asked for, from the Host header or an absolute URI
fn request_hostname<T>(req: &Request<T>) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    let hostname = strip_port(host.trim()).trim_end_matches('.').to_ascii_lowercase();
    if hostname.is_empty() {
        None
    } else {
        Some(hostname)
    }
}

/// `app.local:8080` -> `app.local`, `[::1]:80` -> `::1`
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/path");
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("app.local"), "app.local");
        assert_eq!(strip_port("app.local:8080"), "app.local");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("app.local:"), "app.local");
    }

    #[test]
    fn test_request_hostname() {
        assert_eq!(request_hostname(&request(Some("App.Local:80"))).as_deref(), Some("app.local"));
        assert_eq!(request_hostname(&request(Some("app.local."))).as_deref(), Some("app.local"));
        assert_eq!(request_hostname(&request(Some(""))), None);
        assert_eq!(request_hostname(&request(None)), None);

        let absolute = Request::builder()
            .uri("http://api.local:3000/x")
            .body(())
            .unwrap();
        assert_eq!(request_hostname(&absolute).as_deref(), Some("api.local"));
    }

    #[test]
    fn test_is_upgrade_request() {
        let upgrade = Request::builder()
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        let missing_upgrade = Request::builder()
            .header(CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&missing_upgrade));

        assert!(!is_upgrade_request(&request(Some("app.local"))));
    }

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }
}
