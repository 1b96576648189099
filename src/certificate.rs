//! Certificate provider for TLS termination
//! Mints a self-signed RSA certificate per hostname and keeps it cached until
//! shortly before it expires.

use crate::error::{Error, Result};
use crate::registry::DomainRegistry;
use dashmap::DashMap;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Validity of freshly minted certificates
pub const CERTIFICATE_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Cached certificates closer than this to expiry are regenerated
const RENEW_BEFORE: Duration = Duration::from_secs(24 * 60 * 60);

/// A PEM-encoded key/certificate pair
#[derive(Debug, Clone)]
pub struct Certificate {
    pub private_key_pem: String,
    pub certificate_pem: String,
    pub not_after: SystemTime,
}

impl Certificate {
    /// Build a rustls server configuration presenting this certificate
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let chain = rustls_pemfile::certs(&mut self.certificate_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut self.private_key_pem.as_bytes())?
            .ok_or_else(|| rustls::Error::General("no private key in PEM".to_string()))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    fn is_fresh(&self, now: SystemTime) -> bool {
        self.not_after
            .duration_since(now)
            .map(|left| left > RENEW_BEFORE)
            .unwrap_or(false)
    }
}

/// Certificate provider configuration
#[derive(Debug, Clone)]
pub struct CertificateConfig {
    /// Reuse minted certificates until they near expiry
    pub cache: bool,
    pub validity: Duration,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            cache: true,
            validity: CERTIFICATE_VALIDITY,
        }
    }
}

#[derive(Clone)]
struct CachedCertificate {
    certificate: Arc<Certificate>,
    server_config: Arc<ServerConfig>,
}

/// Hands out certificates for SSL-enabled hostnames
pub struct CertificateProvider {
    registry: Arc<dyn DomainRegistry>,
    config: CertificateConfig,
    cache: DashMap<String, CachedCertificate>,
    /// Per-hostname generation locks
    pending: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CertificateProvider {
    pub fn new(registry: Arc<dyn DomainRegistry>, config: CertificateConfig) -> Self {
        Self {
            registry,
            config,
            cache: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Certificate for `hostname`, or `CertificateUnavailable` when the
    /// hostname has no SSL-enabled mapping.
    pub async fn certificate_for(&self, hostname: &str) -> Result<Arc<Certificate>> {
        Ok(self.resolve(hostname).await?.certificate)
    }

    /// rustls configuration for a TLS handshake with `hostname` as server name
    pub async fn server_config_for(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        Ok(self.resolve(hostname).await?.server_config)
    }

    /// Drop a cached certificate
    pub fn invalidate(&self, hostname: &str) {
        self.cache.remove(&hostname.to_ascii_lowercase());
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    async fn resolve(&self, hostname: &str) -> Result<CachedCertificate> {
        let hostname = hostname.to_ascii_lowercase();

        // The registry is checked before the cache so that disabling SSL
        // takes effect on the next handshake.
        let enabled = self
            .registry
            .lookup(&hostname)?
            .map(|entry| entry.ssl_enabled)
            .unwrap_or(false);
        if !enabled {
            return Err(Error::CertificateUnavailable { hostname });
        }

        if !self.config.cache {
            return self.generate(&hostname).await;
        }

        if let Some(cached) = self.fresh_cached(&hostname) {
            return Ok(cached);
        }

        // One generation per hostname at a time; handshakes that queued up
        // behind it reuse its result.
        let slot = self.pending.entry(hostname.clone()).or_default().clone();
        let _generating = slot.lock().await;

        if let Some(cached) = self.fresh_cached(&hostname) {
            return Ok(cached);
        }

        let entry = self.generate(&hostname).await?;
        self.cache.insert(hostname, entry.clone());
        Ok(entry)
    }

    fn fresh_cached(&self, hostname: &str) -> Option<CachedCertificate> {
        let cached = self.cache.get(hostname)?;
        if cached.certificate.is_fresh(SystemTime::now()) {
            debug!(hostname = %hostname, "Serving cached certificate");
            Some(cached.clone())
        } else {
            None
        }
    }

    async fn generate(&self, hostname: &str) -> Result<CachedCertificate> {
        let validity = self.config.validity;
        let name = hostname.to_string();
        // RSA key generation is slow; keep it off the async workers
        let certificate = tokio::task::spawn_blocking(move || generate_certificate(&name, validity))
            .await
            .map_err(|e| Error::CertificateGeneration {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            })??;

        let server_config = certificate.server_config()?;
        info!(hostname = %hostname, "Generated certificate");

        Ok(CachedCertificate {
            certificate: Arc::new(certificate),
            server_config,
        })
    }
}

/// Generate a self-signed certificate for `hostname`.
///
/// RSA 2048 key, CN = hostname, SANs = {hostname, localhost}, valid from now
/// for `validity`.
pub fn generate_certificate(hostname: &str, validity: Duration) -> Result<Certificate> {
    let failed = |reason: String| Error::CertificateGeneration {
        hostname: hostname.to_string(),
        reason,
    };

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256).map_err(|e| failed(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, hostname.to_string());
    params.distinguished_name = distinguished_name;

    let mut names = vec![hostname];
    if hostname != "localhost" {
        names.push("localhost");
    }
    for name in names {
        let dns_name = name
            .to_string()
            .try_into()
            .map_err(|e: rcgen::Error| failed(e.to_string()))?;
        params.subject_alt_names.push(SanType::DnsName(dns_name));
    }

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = time::OffsetDateTime::now_utc();
    let not_after = now + validity;
    params.not_before = now;
    params.not_after = not_after;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| failed(e.to_string()))?;

    Ok(Certificate {
        private_key_pem: key_pair.serialize_pem(),
        certificate_pem: cert.pem(),
        not_after: SystemTime::from(not_after),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SqliteRegistry;
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;

    fn registry() -> Arc<SqliteRegistry> {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.add_domain("secure.local", 3000, true, true).unwrap();
        registry.add_domain("plain.local", 3001, false, true).unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_generate_certificate_fields() {
        let cert = generate_certificate("app.local", CERTIFICATE_VALIDITY).unwrap();
        assert!(cert.private_key_pem.contains("PRIVATE KEY"));
        assert!(cert.certificate_pem.contains("BEGIN CERTIFICATE"));

        let (_, pem) = parse_x509_pem(cert.certificate_pem.as_bytes()).unwrap();
        let x509 = pem.parse_x509().unwrap();

        let cn = x509
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "app.local");

        let san = x509.subject_alternative_name().unwrap().unwrap();
        let dns: Vec<&str> = san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(dns, vec!["app.local", "localhost"]);

        let days = (x509.validity().not_after.timestamp() - x509.validity().not_before.timestamp())
            / 86_400;
        assert_eq!(days, 365);

        assert!(x509.public_key().algorithm.algorithm.to_id_string().starts_with("1.2.840.113549"));
    }

    #[test]
    fn test_certificate_builds_server_config() {
        let cert = generate_certificate("app.local", CERTIFICATE_VALIDITY).unwrap();
        let config = cert.server_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn test_certificate_unavailable_without_ssl() {
        let provider = CertificateProvider::new(registry(), CertificateConfig::default());

        let err = provider.certificate_for("plain.local").await.unwrap_err();
        assert!(matches!(err, Error::CertificateUnavailable { .. }));

        let err = provider.certificate_for("unknown.local").await.unwrap_err();
        assert!(matches!(err, Error::CertificateUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_certificate_cached_between_calls() {
        let provider = CertificateProvider::new(registry(), CertificateConfig::default());

        let first = provider.certificate_for("secure.local").await.unwrap();
        let second = provider.certificate_for("SECURE.local").await.unwrap();
        assert_eq!(first.certificate_pem, second.certificate_pem);
        assert_eq!(provider.cached_count(), 1);

        provider.invalidate("secure.local");
        assert_eq!(provider.cached_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_handshakes_share_one_certificate() {
        let provider = Arc::new(CertificateProvider::new(registry(), CertificateConfig::default()));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let provider = provider.clone();
                tokio::spawn(async move { provider.certificate_for("secure.local").await })
            })
            .collect();

        let mut pems = Vec::new();
        for task in tasks {
            pems.push(task.await.unwrap().unwrap().certificate_pem.clone());
        }

        assert!(pems.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(provider.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_certificate_regenerated_without_cache() {
        let config = CertificateConfig {
            cache: false,
            ..CertificateConfig::default()
        };
        let provider = CertificateProvider::new(registry(), config);

        let first = provider.certificate_for("secure.local").await.unwrap();
        let second = provider.certificate_for("secure.local").await.unwrap();
        assert_ne!(first.certificate_pem, second.certificate_pem);
        assert_eq!(provider.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_disabling_ssl_bypasses_cache() {
        let registry = registry();
        let provider = CertificateProvider::new(registry.clone(), CertificateConfig::default());

        provider.certificate_for("secure.local").await.unwrap();
        registry.set_ssl_enabled("secure.local", false).unwrap();

        assert!(matches!(
            provider.certificate_for("secure.local").await,
            Err(Error::CertificateUnavailable { .. })
        ));
    }
}
