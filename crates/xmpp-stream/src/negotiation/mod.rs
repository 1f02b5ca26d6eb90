//! Client stream negotiation.
//!
//! Brings a freshly connected transport to a bound session, strictly in
//! order: open the stream, STARTTLS (then restart), optional in-band
//! registration, SASL (then restart), resource binding, the optional legacy
//! session, optional stream management, and finally the extensions'
//! post-session hooks. Any failure aborts the whole attempt; nothing here
//! retries.

pub mod bind;
pub mod sasl;
pub mod session;
pub mod starttls;
pub mod stream_management;

pub use sasl::{Authenticator, SaslAuthenticator};
pub use session::SessionPolicy;
pub use stream_management::{StreamManagementOptions, StreamManagementSession};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::stanza::StreamFeatures;
use crate::stream::{Stream, TlsUpgrader, DEFAULT_TIMEOUT};
use crate::{ns, Error};

/// Local STARTTLS policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Never upgrade; fail if the server insists.
    Off,
    /// Upgrade when offered.
    #[default]
    On,
    /// Fail unless the server offers STARTTLS.
    Required,
}

impl TlsPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsPolicy::Off => "off",
            TlsPolicy::On => "on",
            TlsPolicy::Required => "required",
        }
    }
}

impl fmt::Display for TlsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(TlsPolicy::Off),
            "on" => Ok(TlsPolicy::On),
            "required" => Ok(TlsPolicy::Required),
            other => Err(Error::Config(format!("Invalid TLS option: {}", other))),
        }
    }
}

/// Hook for in-band registration, run after STARTTLS and before SASL.
#[async_trait]
pub trait RegistrationHandler: Send + Sync {
    async fn register(&self, stream: &Stream, features: &StreamFeatures) -> Result<(), Error>;
}

/// Drives the negotiation sequence over a [`Stream`].
#[derive(Clone)]
pub struct Negotiator {
    tls: TlsPolicy,
    session: SessionPolicy,
    stream_management: Option<StreamManagementOptions>,
    timeout: Duration,
    upgrader: Arc<dyn TlsUpgrader>,
    authenticator: Arc<dyn Authenticator>,
    registration: Option<Arc<dyn RegistrationHandler>>,
}

impl Negotiator {
    pub fn new(tls: TlsPolicy, upgrader: Arc<dyn TlsUpgrader>) -> Self {
        Self {
            tls,
            session: SessionPolicy::default(),
            stream_management: None,
            timeout: DEFAULT_TIMEOUT,
            upgrader,
            authenticator: Arc::new(SaslAuthenticator),
            registration: None,
        }
    }

    pub fn session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session = policy;
        self
    }

    /// Enable stream management when the server offers it.
    pub fn stream_management(mut self, options: Option<StreamManagementOptions>) -> Self {
        self.stream_management = options;
        self
    }

    /// Bound applied to every wait during negotiation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn registration(mut self, handler: Option<Arc<dyn RegistrationHandler>>) -> Self {
        self.registration = handler;
        self
    }

    #[instrument(skip_all, fields(jid = %stream.jid()), name = "xmpp.negotiation")]
    pub async fn negotiate(&self, stream: &Stream) -> Result<(), Error> {
        let timeout = self.timeout;
        let domain = stream.jid().domain().to_string();

        let mut features = stream.open(timeout).await?;

        if starttls::should_upgrade(self.tls, &features)? {
            starttls::negotiate(stream, self.upgrader.as_ref(), &domain, timeout).await?;
            features = stream.restart(timeout).await?;
        }

        if let Some(registration) = &self.registration {
            debug!("Running in-band registration");
            registration.register(stream, &features).await?;
        }

        let mechanisms = features
            .get_feature("mechanisms", ns::SASL)
            .cloned()
            .ok_or_else(|| Error::negotiation("Missing mechanisms feature"))?;
        self.authenticator
            .authenticate(stream, &mechanisms, timeout)
            .await?;
        features = stream.restart(timeout).await?;

        if !features.has_feature("bind", ns::BIND) {
            return Err(Error::negotiation("Missing bind feature"));
        }
        bind::bind(stream, timeout).await?;

        if session::should_start(self.session, &features) {
            session::start(stream, timeout).await?;
        }

        if let Some(options) = self.stream_management {
            if features.has_feature("sm", ns::SM) {
                let session = stream_management::enable(stream, options, timeout).await?;
                stream.set_stream_management(session);
            } else {
                debug!("Stream management not offered by server");
            }
        }

        info!(jid = %stream.jid(), tls = stream.tls_active(), "Session established");
        stream.run_post_session().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_policy_parsing() {
        assert_eq!("off".parse::<TlsPolicy>().unwrap(), TlsPolicy::Off);
        assert_eq!("required".parse::<TlsPolicy>().unwrap(), TlsPolicy::Required);
        assert!(matches!("maybe".parse::<TlsPolicy>(), Err(Error::Config(_))));
        assert_eq!(TlsPolicy::default().to_string(), "on");
    }
}
