//! Byte transports and in-place TLS upgrade.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, instrument};

use crate::Error;

/// A reliable ordered byte stream the engine can own.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased transport; TCP before STARTTLS, a TLS session after.
pub type BoxedIo = Box<dyn Io>;

/// Upgrades a plain transport to an encrypted one without reconnecting.
#[async_trait]
pub trait TlsUpgrader: Send + Sync {
    /// Run the TLS handshake over `io`, verifying the certificate for `domain`.
    async fn upgrade(&self, io: BoxedIo, domain: &str) -> Result<BoxedIo, Error>;
}

/// [`TlsUpgrader`] using rustls with the webpki root store.
#[derive(Clone)]
pub struct RustlsUpgrader {
    connector: TlsConnector,
}

impl RustlsUpgrader {
    pub fn new() -> Result<Self, Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Failed to build TLS config: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self::with_config(Arc::new(config)))
    }

    /// Use a caller-provided rustls configuration (custom roots, client certs).
    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

#[async_trait]
impl TlsUpgrader for RustlsUpgrader {
    #[instrument(skip(self, io), name = "xmpp.tls.upgrade")]
    async fn upgrade(&self, io: BoxedIo, domain: &str) -> Result<BoxedIo, Error> {
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| Error::Tls(format!("Invalid server name: {}", e)))?;

        let tls = self
            .connector
            .connect(server_name, io)
            .await
            .map_err(|e| {
                error!(domain, error = %e, "TLS handshake failed");
                Error::Tls(format!("TLS handshake failed with {}: {}", domain, e))
            })?;
        debug!(domain, "TLS established");
        Ok(Box::new(tls))
    }
}

/// Leaves the transport untouched. For tests and for links that are already
/// secured below the XMPP layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTls;

#[async_trait]
impl TlsUpgrader for NoTls {
    async fn upgrade(&self, io: BoxedIo, _domain: &str) -> Result<BoxedIo, Error> {
        Ok(io)
    }
}
