//! Error types for the XMPP stream core.

use std::time::Duration;

use thiserror::Error;

use crate::resolver::ResolveError;
use crate::stanza::StanzaError;

/// Errors raised by the stream, the parser and the stanza model.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error on the transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed XML on the wire; fatal to the stream
    #[error("XML parse error: {0}")]
    Parse(String),

    /// An element did not have the shape of the expected stanza type
    #[error("Malformed stanza: {0}")]
    MalformedStanza(String),

    /// Invalid JID
    #[error("Invalid JID: {0}")]
    Jid(String),

    /// Invalid waiter predicate
    #[error("Invalid predicate: {0}")]
    Predicate(String),

    /// No matching stanza arrived in time
    #[error("Timeout ({timeout:?}) while waiting for {predicates}")]
    Timeout {
        /// How long the caller waited
        timeout: Duration,
        /// Rendered predicates the waiter was registered with
        predicates: String,
    },

    /// A stanza carried an error payload and the caller asked for it to be raised
    #[error("Stanza error: {0}")]
    Stanza(StanzaError),

    /// The peer sent a `<stream:error/>`
    #[error("Stream error: {condition}{}", text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    Stream {
        /// Defined condition element name
        condition: String,
        /// Optional descriptive text
        text: Option<String>,
    },

    /// A feature negotiation step failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// The stream is closed (locally, by the peer, or after a fatal error)
    #[error("Stream closed: {0}")]
    Closed(String),

    /// Two extensions claim the same identity or export name
    #[error("Extension '{extension}' exports ambiguous name '{name}'")]
    DuplicateExtension {
        /// Extension being registered
        extension: String,
        /// Name already claimed
        name: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new malformed stanza error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedStanza(msg.into())
    }

    /// Create a new negotiation error.
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Self::Negotiation(msg.into())
    }

    /// Create a new closed-stream error.
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Whether this error is local to a single `wait` and leaves the stream usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Phase-tagged error returned by [`crate::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// No usable endpoint found for the domain
    #[error("could not resolve {host}: {source}")]
    Resolution {
        /// Host that was being resolved
        host: String,
        #[source]
        source: ResolveError,
    },

    /// TCP connect failed or timed out
    #[error("could not connect to {host}:{port}: {source}")]
    Transport {
        /// Resolved host
        host: String,
        /// Resolved port
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The stream was opened but negotiation did not complete
    #[error("stream negotiation failed: {0}")]
    Negotiation(#[source] Error),

    /// Options were rejected before any network activity
    #[error("invalid connect options: {0}")]
    Setup(#[source] Error),
}

impl ConnectError {
    /// Process exit code for command-line front ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Setup(_) => 2,
            Self::Resolution { .. } => 3,
            Self::Transport { .. } => 4,
            Self::Negotiation(_) => 5,
        }
    }
}

/// A specialized Result type for stream operations.
pub type Result<T> = std::result::Result<T, Error>;
