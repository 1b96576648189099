//! chost - Main entry point
//!
//! Runs the hostname-routed reverse proxy until Ctrl-C, reloading on SIGHUP.

use anyhow::Result;
use chost::{
    CertificateConfig, CertificateProvider, Dispatcher, DispatcherConfig, DomainRegistry,
    HostsConfig, HostsReconciler, SqliteRegistry,
};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// chost - hostname-routed local reverse proxy
#[derive(Parser, Debug)]
#[command(name = "chost")]
#[command(author = "CHost Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Route memorable hostnames to local ports over HTTP and HTTPS")]
struct Args {
    /// Domain registry database
    #[arg(long, env = "CHOST_DB_PATH", default_value = "./data/chost.db")]
    db_path: PathBuf,

    /// HTTP port (overrides the registry setting)
    #[arg(long, env = "CHOST_HTTP_PORT")]
    http_port: Option<u16>,

    /// HTTPS port (overrides the registry setting)
    #[arg(long, env = "CHOST_HTTPS_PORT")]
    https_port: Option<u16>,

    /// Address to listen on
    #[arg(long, env = "CHOST_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Seconds open connections may drain on shutdown
    #[arg(long, default_value = "5")]
    shutdown_grace: u64,

    /// Generate a fresh certificate on every TLS handshake
    #[arg(long)]
    no_cert_cache: bool,

    /// Hosts file to keep in sync
    #[arg(long, env = "CHOST_HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Do not touch the hosts file on startup
    #[arg(long)]
    no_hosts_sync: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting chost v1.0.0");

    let registry = Arc::new(SqliteRegistry::open(&args.db_path)?);
    info!("Registry opened at: {}", args.db_path.display());

    let settings = registry.settings()?;
    let http_port = args.http_port.unwrap_or(settings.http_port);
    let https_port = args.https_port.unwrap_or(settings.https_port);

    if !args.no_hosts_sync {
        let config = args
            .hosts_file
            .clone()
            .map(HostsConfig::new)
            .unwrap_or_default();
        let reconciler = HostsReconciler::new(config);
        match reconciler.sync_registry(registry.as_ref(), false) {
            Ok(true) => info!("Hosts file updated: {}", reconciler.path().display()),
            Ok(false) => info!("Hosts file already up to date"),
            Err(e) => warn!("Hosts file not synchronized: {}", e),
        }
    }

    let certificates = Arc::new(CertificateProvider::new(
        registry.clone(),
        CertificateConfig {
            cache: !args.no_cert_cache,
            ..CertificateConfig::default()
        },
    ));

    let config = DispatcherConfig {
        bind_address: args.bind,
        shutdown_grace: std::time::Duration::from_secs(args.shutdown_grace),
    };
    let mut dispatcher = Dispatcher::new(registry, certificates.clone(), config);

    if let Err(e) = dispatcher.start(http_port, https_port).await {
        if e.is_privilege_error() {
            error!("{}", e);
            error!("Ports below 1024 require elevated privileges; re-run with sudo or choose higher ports");
        }
        return Err(e.into());
    }

    info!("chost started (http {}, https {})", http_port, https_port);

    wait_for_signals(&mut dispatcher, &certificates).await?;

    dispatcher.stop().await;
    Ok(())
}

/// Block until Ctrl-C; SIGHUP reloads the listeners
#[cfg(unix)]
async fn wait_for_signals(dispatcher: &mut Dispatcher, certificates: &CertificateProvider) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("Reloading");
                certificates.clear_cache();
                dispatcher.reload().await?;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_dispatcher: &mut Dispatcher, _certificates: &CertificateProvider) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    Ok(())
}
