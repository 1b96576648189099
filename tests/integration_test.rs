//! Integration tests for chost
//!
//! Tests the full dispatcher including:
//! - Hostname routing to local backends
//! - 404 / 502 / 400 error pages
//! - Upgraded (tunnelled) connections
//! - SNI certificate selection on the TLS listener
//! - start / stop / reload lifecycle

use bytes::Bytes;
use chost::{
    BindCause, CertificateConfig, CertificateProvider, Dispatcher, DispatcherConfig, Error,
    SqliteRegistry,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

struct TestProxy {
    _dir: TempDir,
    registry: Arc<SqliteRegistry>,
    dispatcher: Dispatcher,
}

impl TestProxy {
    async fn start() -> Self {
        let dir = tempdir().unwrap();
        let registry = Arc::new(SqliteRegistry::open(dir.path().join("chost.db")).unwrap());
        let certificates = Arc::new(CertificateProvider::new(
            registry.clone(),
            CertificateConfig::default(),
        ));
        let config = DispatcherConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            shutdown_grace: Duration::from_secs(1),
        };

        let mut dispatcher = Dispatcher::new(registry.clone(), certificates, config);
        dispatcher.start(0, 0).await.unwrap();

        Self {
            _dir: dir,
            registry,
            dispatcher,
        }
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.dispatcher.http_addr().unwrap(), path)
    }

    fn https_port(&self) -> u16 {
        self.dispatcher.https_addr().unwrap().port()
    }
}

/// Simple backend server for testing, returns its port
async fn run_backend_server(response_body: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let uri = req.uri().to_string();
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("unknown")
                        .to_string();
                    let x_forwarded_for = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let x_forwarded_proto = req
                        .headers()
                        .get("x-forwarded-proto")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();

                    let response_text = format!(
                        "{}|uri={}|host={}|xff={}|proto={}|body={}",
                        response_body,
                        uri,
                        host,
                        x_forwarded_for,
                        x_forwarded_proto,
                        String::from_utf8_lossy(&body)
                    );

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(201)
                            .body(Full::new(Bytes::from(response_text)))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    port
}

/// Backend that accepts `Upgrade: echo` and echoes raw bytes afterwards
async fn run_echo_upgrade_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|mut req: Request<Incoming>| async move {
                    let on_upgrade = hyper::upgrade::on(&mut req);
                    tokio::spawn(async move {
                        if let Ok(upgraded) = on_upgrade.await {
                            let mut io = TokioIo::new(upgraded);
                            let mut buf = [0u8; 1024];
                            loop {
                                match io.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if io.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    });

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(StatusCode::SWITCHING_PROTOCOLS)
                            .header("connection", "upgrade")
                            .header("upgrade", "echo")
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    port
}

/// A port with nothing listening on it
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn raw_request(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut response = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(5), stream.read(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&response[..n]).to_string()
}

#[tokio::test]
async fn test_proxy_forwards_by_host() {
    let proxy = TestProxy::start().await;
    let backend_port = run_backend_server("APP_BACKEND").await;
    proxy
        .registry
        .add_domain("app.local", backend_port, false, true)
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(proxy.http_url("/test?foo=bar&baz=qux"))
        .header("Host", "app.local:8080")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    let body = response.text().await.unwrap();
    assert!(body.contains("APP_BACKEND"));
    assert!(body.contains("uri=/test?foo=bar&baz=qux"));
    assert!(body.contains("host=app.local:8080"));
    assert!(body.contains("xff=127.0.0.1"));
    assert!(body.contains("proto=http"));
}

#[tokio::test]
async fn test_proxy_routes_each_host_to_its_port() {
    let proxy = TestProxy::start().await;
    let app_port = run_backend_server("APP").await;
    let api_port = run_backend_server("API").await;
    proxy.registry.add_domain("app.local", app_port, false, true).unwrap();
    proxy.registry.add_domain("api.local", api_port, false, true).unwrap();

    let client = reqwest::Client::new();
    let app = client
        .get(proxy.http_url("/"))
        .header("Host", "app.local")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let api = client
        .get(proxy.http_url("/"))
        .header("Host", "API.local")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(app.starts_with("APP|"));
    assert!(api.starts_with("API|"));
}

#[tokio::test]
async fn test_proxy_post_body_forwarded() {
    let proxy = TestProxy::start().await;
    let backend_port = run_backend_server("POST_TEST").await;
    proxy
        .registry
        .add_domain("app.local", backend_port, false, true)
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(proxy.http_url("/api/data"))
        .header("Host", "app.local")
        .body("test body content")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert!(response.text().await.unwrap().contains("body=test body content"));
}

#[tokio::test]
async fn test_proxy_unmapped_host_404() {
    let proxy = TestProxy::start().await;

    let client = reqwest::Client::new();
    let response = client
        .get(proxy.http_url("/test"))
        .header("Host", "unknown.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    assert!(response.text().await.unwrap().contains("unknown.local"));
}

#[tokio::test]
async fn test_proxy_disabled_host_404() {
    let proxy = TestProxy::start().await;
    let backend_port = run_backend_server("SHOULD_NOT_SEE").await;
    proxy
        .registry
        .add_domain("app.local", backend_port, false, false)
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(proxy.http_url("/"))
        .header("Host", "app.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    let body = response.text().await.unwrap();
    assert!(body.contains("app.local"));
    assert!(!body.contains("SHOULD_NOT_SEE"));
}

#[tokio::test]
async fn test_backend_unreachable_502() {
    let proxy = TestProxy::start().await;
    let backend_port = unused_port().await;
    proxy
        .registry
        .add_domain("app.local", backend_port, false, true)
        .unwrap();

    let client = reqwest::Client::new();
    let response = client
        .get(proxy.http_url("/test"))
        .header("Host", "app.local")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
    let body = response.text().await.unwrap();
    assert!(body.contains("app.local"));
    assert!(body.contains(&backend_port.to_string()));

    // The dispatcher keeps serving after a failed request
    let response = client
        .get(proxy.http_url("/test"))
        .header("Host", "other.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_proxy_missing_host_400() {
    let proxy = TestProxy::start().await;

    let response = raw_request(
        proxy.dispatcher.http_addr().unwrap(),
        b"GET /test HTTP/1.1\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn test_upgrade_is_tunnelled() {
    let proxy = TestProxy::start().await;
    let backend_port = run_echo_upgrade_server().await;
    proxy
        .registry
        .add_domain("ws.local", backend_port, false, true)
        .unwrap();

    let mut stream = TcpStream::connect(proxy.dispatcher.http_addr().unwrap())
        .await
        .unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: ws.local\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1, "connection closed before upgrade completed");
        head.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

    stream.write_all(b"ping through the tunnel").await.unwrap();
    let mut echoed = vec![0u8; 23];
    timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");
}

#[tokio::test]
async fn test_slow_backend_does_not_block_others() {
    let proxy = TestProxy::start().await;

    let slow_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let slow_port = slow_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = slow_listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    sleep(Duration::from_secs(3)).await;
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("slow"))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    let fast_port = run_backend_server("FAST").await;

    proxy.registry.add_domain("slow.local", slow_port, false, true).unwrap();
    proxy.registry.add_domain("fast.local", fast_port, false, true).unwrap();

    let client = reqwest::Client::new();
    let slow_url = proxy.http_url("/");
    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client
            .get(slow_url)
            .header("Host", "slow.local")
            .send()
            .await
    });

    sleep(Duration::from_millis(100)).await;

    let fast = timeout(
        Duration::from_secs(1),
        client.get(proxy.http_url("/")).header("Host", "fast.local").send(),
    )
    .await
    .expect("fast backend stalled behind slow one")
    .unwrap();
    assert!(fast.text().await.unwrap().starts_with("FAST|"));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.text().await.unwrap(), "slow");
}

fn tls_client(hostname: &str, https_port: u16) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .tls_info(true)
        .resolve(
            hostname,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), https_port),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_tls_certificate_matches_server_name() {
    let proxy = TestProxy::start().await;
    let backend_port = run_backend_server("SECURE").await;
    proxy
        .registry
        .add_domain("secure.local", backend_port, true, true)
        .unwrap();

    let https_port = proxy.https_port();
    let client = tls_client("secure.local", https_port);
    let response = client
        .get(format!("https://secure.local:{}/", https_port))
        .send()
        .await
        .unwrap();

    let tls_info = response
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .cloned()
        .unwrap();
    let der = tls_info.peer_certificate().unwrap().to_vec();
    let (_, cert) = x509_parser::parse_x509_certificate(&der).unwrap();
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap();
    assert_eq!(cn, "secure.local");

    assert_eq!(response.status().as_u16(), 201);
    assert!(response.text().await.unwrap().contains("proto=https"));
}

#[tokio::test]
async fn test_tls_refused_without_ssl() {
    let proxy = TestProxy::start().await;
    let backend_port = run_backend_server("PLAIN").await;
    proxy
        .registry
        .add_domain("plain.local", backend_port, false, true)
        .unwrap();

    let https_port = proxy.https_port();
    let client = tls_client("plain.local", https_port);
    let result = client
        .get(format!("https://plain.local:{}/", https_port))
        .send()
        .await;
    assert!(result.is_err());

    // Plain HTTP for the same host still works and the TLS listener survives
    let response = reqwest::Client::new()
        .get(proxy.http_url("/"))
        .header("Host", "plain.local")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    proxy.registry.set_ssl_enabled("plain.local", true).unwrap();
    let response = client
        .get(format!("https://plain.local:{}/", https_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_closes_listeners() {
    let mut proxy = TestProxy::start().await;
    let http_addr = proxy.dispatcher.http_addr().unwrap();

    proxy.dispatcher.stop().await;
    assert!(!proxy.dispatcher.is_running());
    assert!(proxy.dispatcher.http_addr().is_none());
    assert!(TcpStream::connect(http_addr).await.is_err());

    proxy.dispatcher.stop().await;
}

#[tokio::test]
async fn test_reload_restarts_listeners() {
    let mut proxy = TestProxy::start().await;
    let backend_port = run_backend_server("RELOADED").await;

    proxy.dispatcher.reload().await.unwrap();
    assert!(proxy.dispatcher.is_running());

    proxy
        .registry
        .add_domain("app.local", backend_port, false, true)
        .unwrap();
    let response = reqwest::Client::new()
        .get(proxy.http_url("/"))
        .header("Host", "app.local")
        .send()
        .await
        .unwrap();
    assert!(response.text().await.unwrap().starts_with("RELOADED|"));
}

#[tokio::test]
async fn test_start_twice_rejected() {
    let mut proxy = TestProxy::start().await;
    assert!(matches!(
        proxy.dispatcher.start(0, 0).await,
        Err(Error::AlreadyRunning)
    ));
}

#[tokio::test]
async fn test_bind_error_reports_address_in_use() {
    let proxy = TestProxy::start().await;
    let taken = proxy.dispatcher.http_addr().unwrap().port();

    let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
    let certificates = Arc::new(CertificateProvider::new(
        registry.clone(),
        CertificateConfig::default(),
    ));
    let mut second = Dispatcher::new(
        registry,
        certificates,
        DispatcherConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..DispatcherConfig::default()
        },
    );

    match second.start(taken, 0).await {
        Err(Error::Bind { port, cause, .. }) => {
            assert_eq!(port, taken);
            assert_eq!(cause, BindCause::AddressInUse);
        }
        other => panic!("expected bind error, got {:?}", other.map(|_| ())),
    }
    assert!(!second.is_running());
}
