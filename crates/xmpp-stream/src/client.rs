//! Application-facing connect.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use jid::Jid;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use crate::error::ConnectError;
use crate::negotiation::{
    Authenticator, Negotiator, RegistrationHandler, SessionPolicy, StreamManagementOptions,
    TlsPolicy,
};
use crate::resolver::{Endpoint, EndpointCache, Resolver, DEFAULT_CLIENT_PORT};
use crate::stream::{
    Extensions, Io, NoCallbacks, RustlsUpgrader, Stream, StreamCallbacks, StreamOptions,
    TlsUpgrader, DEFAULT_TIMEOUT,
};
use crate::Error;

/// Account JID and password.
#[derive(Clone)]
pub struct Credentials {
    pub jid: Jid,
    password: String,
}

impl Credentials {
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        Self {
            jid,
            password: password.into(),
        }
    }

    pub fn parse(jid: &str, password: impl Into<String>) -> Result<Self, Error> {
        let jid = Jid::new(jid).map_err(|e| Error::Jid(e.to_string()))?;
        Ok(Self::new(jid, password))
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("jid", &self.jid.to_string())
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything [`connect`] needs.
pub struct ConnectOptions {
    pub credentials: Credentials,
    /// Host to resolve instead of the JID's domain.
    pub host: Option<String>,
    pub port: u16,
    pub tls: TlsPolicy,
    pub session: SessionPolicy,
    pub stream_management: Option<StreamManagementOptions>,
    pub timeout: Duration,
    pub extensions: Extensions,
    pub callbacks: Arc<dyn StreamCallbacks>,
    pub registration: Option<Arc<dyn RegistrationHandler>>,
    /// Defaults to rustls with the webpki roots.
    pub upgrader: Option<Arc<dyn TlsUpgrader>>,
    /// Defaults to SASL with SCRAM/PLAIN.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Defaults to a system resolver with a fresh cache.
    pub resolver: Option<Resolver>,
}

impl ConnectOptions {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            host: None,
            port: DEFAULT_CLIENT_PORT,
            tls: TlsPolicy::default(),
            session: SessionPolicy::default(),
            stream_management: None,
            timeout: DEFAULT_TIMEOUT,
            extensions: Extensions::new(),
            callbacks: Arc::new(NoCallbacks),
            registration: None,
            upgrader: None,
            authenticator: None,
            resolver: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    pub fn session(mut self, session: SessionPolicy) -> Self {
        self.session = session;
        self
    }

    pub fn stream_management(mut self, options: StreamManagementOptions) -> Self {
        self.stream_management = Some(options);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn StreamCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn registration(mut self, handler: Arc<dyn RegistrationHandler>) -> Self {
        self.registration = Some(handler);
        self
    }

    pub fn upgrader(mut self, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

/// Resolve, connect over TCP and negotiate a session.
///
/// Errors name the phase that failed so callers can react differently to a
/// DNS failure, an unreachable server and a rejected login.
#[instrument(skip(options), fields(jid = %options.credentials.jid), name = "xmpp.connect")]
pub async fn connect(options: ConnectOptions) -> Result<Stream, ConnectError> {
    let callbacks = options.callbacks.clone();
    let host = options
        .host
        .clone()
        .unwrap_or_else(|| options.credentials.jid.domain().to_string());

    let resolver = options
        .resolver
        .clone()
        .unwrap_or_else(|| Resolver::new(EndpointCache::new()));
    let endpoint = match resolver.resolve(&host, options.port, true).await {
        Ok(endpoint) => endpoint,
        Err(source) => {
            let error = ConnectError::Resolution { host, source };
            callbacks.connection_failed(&error);
            return Err(error);
        }
    };

    info!(%endpoint, "Connecting");
    callbacks.connecting(&endpoint);
    let tcp = match tcp_connect(&endpoint, options.timeout).await {
        Ok(tcp) => tcp,
        Err(source) => {
            let error = ConnectError::Transport {
                host: endpoint.host.clone(),
                port: endpoint.port,
                source,
            };
            warn!(error = %error, "Connection failed");
            callbacks.connection_failed(&error);
            return Err(error);
        }
    };
    callbacks.connected(&endpoint);

    connect_over(tcp, options).await
}

async fn tcp_connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpStream> {
    let connecting = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let tcp = tokio::time::timeout(timeout, connecting)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(tcp)
}

/// Negotiate a session over an already connected transport.
pub async fn connect_over<T: Io>(io: T, options: ConnectOptions) -> Result<Stream, ConnectError> {
    let callbacks = options.callbacks.clone();

    let upgrader: Arc<dyn TlsUpgrader> = match options.upgrader {
        Some(upgrader) => upgrader,
        None => Arc::new(RustlsUpgrader::new().map_err(ConnectError::Setup)?),
    };
    let mut negotiator = Negotiator::new(options.tls, upgrader)
        .session_policy(options.session)
        .stream_management(options.stream_management)
        .timeout(options.timeout)
        .registration(options.registration);
    if let Some(authenticator) = options.authenticator {
        negotiator = negotiator.authenticator(authenticator);
    }

    let stream = Stream::new(
        io,
        options.credentials,
        StreamOptions {
            extensions: options.extensions,
            callbacks: callbacks.clone(),
            default_timeout: options.timeout,
        },
    );

    match negotiator.negotiate(&stream).await {
        Ok(()) => {
            callbacks.session_started(&stream.jid());
            Ok(stream)
        }
        Err(e) => {
            stream.close().await;
            let error = ConnectError::Negotiation(e);
            warn!(error = %error, "Negotiation failed");
            callbacks.connection_failed(&error);
            Err(error)
        }
    }
}
