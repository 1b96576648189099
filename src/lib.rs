//! chost - reach local processes through memorable hostnames
//!
//! Provides:
//! - Hostname-based routing of HTTP/HTTPS traffic to local ports
//! - Self-signed certificates minted on demand per hostname (SNI)
//! - A managed block in the system hosts file kept in sync with the mappings
//! - A SQLite-backed domain registry

pub mod certificate;
pub mod error;
pub mod hosts;
pub mod pages;
pub mod proxy;
pub mod registry;

pub use certificate::{Certificate, CertificateConfig, CertificateProvider};
pub use error::{BindCause, Error, Result};
pub use hosts::{HostsBlock, HostsConfig, HostsReconciler};
pub use proxy::{Dispatcher, DispatcherConfig};
pub use registry::{DomainEntry, DomainRegistry, Settings, SqliteRegistry};
