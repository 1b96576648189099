//! Error types shared by the dispatcher, certificate provider and hosts reconciler.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a listener could not be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindCause {
    /// Another process already listens on the port
    AddressInUse,
    /// The process may not bind the port (usually a privileged port below 1024)
    PermissionDenied,
    /// Any other bind failure
    Other,
}

impl BindCause {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => BindCause::AddressInUse,
            io::ErrorKind::PermissionDenied => BindCause::PermissionDenied,
            _ => BindCause::Other,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            BindCause::AddressInUse => "port is already in use",
            BindCause::PermissionDenied => {
                "permission denied (ports below 1024 need elevated privileges, try running with sudo)"
            }
            BindCause::Other => "bind failed",
        }
    }
}

/// Main error type for chost.
#[derive(Error, Debug)]
pub enum Error {
    /// A listener could not be bound.
    #[error("cannot listen on port {port}: {}: {source}", .cause.describe())]
    Bind {
        port: u16,
        cause: BindCause,
        #[source]
        source: io::Error,
    },

    /// `start()` was called on a dispatcher that is already running.
    #[error("proxy is already running")]
    AlreadyRunning,

    /// The backend for a hostname could not be reached.
    #[error("backend for {hostname} on port {port} is unavailable: {reason}")]
    UpstreamUnavailable {
        hostname: String,
        port: u16,
        reason: String,
    },

    /// No enabled mapping exists for the requested hostname.
    #[error("no enabled mapping for {hostname}")]
    UnmappedHost { hostname: String },

    /// The hostname has no SSL-enabled mapping.
    #[error("no certificate available for {hostname}")]
    CertificateUnavailable { hostname: String },

    /// Minting a certificate failed.
    #[error("failed to generate certificate for {hostname}: {reason}")]
    CertificateGeneration { hostname: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// The hosts file may not be modified by this process.
    #[error("permission denied writing {}; re-run with administrator privileges (e.g. sudo)", .path.display())]
    HostsPermission { path: PathBuf },

    /// Reading or writing the hosts file failed for a reason other than permissions.
    #[error("hosts file I/O error on {}: {source}", .path.display())]
    HostsIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The managed block in the hosts file is damaged and will not be rewritten.
    #[error("malformed managed block in {}: {reason}", .path.display())]
    MalformedHostsBlock { path: PathBuf, reason: String },

    #[error("invalid hostname '{hostname}': {reason}")]
    InvalidHostname { hostname: String, reason: String },

    #[error("invalid port {0}: must be between 1 and 65535")]
    InvalidPort(u32),

    #[error("domain {0} is already registered")]
    DuplicateDomain(String),

    #[error("domain {0} is not registered")]
    UnknownDomain(String),

    #[error("registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn bind(port: u16, source: io::Error) -> Self {
        Error::Bind {
            port,
            cause: BindCause::from_io(&source),
            source,
        }
    }

    pub(crate) fn hosts_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            Error::HostsPermission { path }
        } else {
            Error::HostsIo { path, source }
        }
    }

    /// True when the operator should retry with elevated privileges rather than
    /// simply retrying.
    pub fn is_privilege_error(&self) -> bool {
        matches!(
            self,
            Error::Bind {
                cause: BindCause::PermissionDenied,
                ..
            } | Error::HostsPermission { .. }
        )
    }
}

/// Result type alias using chost's Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_cause_from_io() {
        let err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        assert_eq!(BindCause::from_io(&err), BindCause::AddressInUse);

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(BindCause::from_io(&err), BindCause::PermissionDenied);

        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(BindCause::from_io(&err), BindCause::Other);
    }

    #[test]
    fn test_bind_permission_is_privilege_error() {
        let err = Error::bind(80, io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(err.is_privilege_error());
        assert!(err.to_string().contains("sudo"));
        assert!(err.to_string().contains("80"));

        let err = Error::bind(8080, io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(!err.is_privilege_error());
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn test_hosts_io_maps_permission_denied() {
        let err = Error::hosts_io(
            "/etc/hosts",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(matches!(err, Error::HostsPermission { .. }));
        assert!(err.is_privilege_error());

        let err = Error::hosts_io("/etc/hosts", io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(matches!(err, Error::HostsIo { .. }));
    }
}
