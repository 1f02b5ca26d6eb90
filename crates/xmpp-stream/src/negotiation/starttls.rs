//! STARTTLS (RFC 6120 section 5).

use std::time::Duration;

use tracing::{debug, instrument};

use super::TlsPolicy;
use crate::predicate::Predicate;
use crate::stanza::{Stanza, StreamFeatures};
use crate::stream::{Stream, TlsUpgrader};
use crate::{ns, Error};

/// Decide whether to upgrade, failing when policy and offer are
/// incompatible.
pub fn should_upgrade(policy: TlsPolicy, features: &StreamFeatures) -> Result<bool, Error> {
    let offer = features.get_feature("starttls", ns::TLS);
    match (policy, offer) {
        (TlsPolicy::Required, None) => Err(Error::negotiation(
            "TLS required by client but not offered by server",
        )),
        (TlsPolicy::Off, Some(feature)) if feature.has_child("required", ns::TLS) => Err(
            Error::negotiation("TLS off by client but required by server"),
        ),
        (TlsPolicy::Off, _) | (_, None) => Ok(false),
        (_, Some(_)) => Ok(true),
    }
}

/// Request the upgrade and, once the server proceeds, run the handshake.
#[instrument(skip(stream, upgrader), name = "xmpp.negotiation.starttls")]
pub async fn negotiate(
    stream: &Stream,
    upgrader: &dyn TlsUpgrader,
    domain: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let pending = stream.expect(vec![
        Predicate::element("proceed", Some(ns::TLS)),
        Predicate::element("failure", Some(ns::TLS)),
    ])?;
    stream.send(&Stanza::new("starttls", ns::TLS)).await?;

    let reply = pending.wait(timeout).await?;
    if reply.name() != "proceed" {
        return Err(Error::negotiation(format!(
            "starttls failure: {}",
            reply.to_xml().unwrap_or_default()
        )));
    }

    debug!("Server accepted STARTTLS, upgrading transport");
    stream.starttls(upgrader, domain).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;

    fn features(xml: &str) -> StreamFeatures {
        let element: Element = xml.parse().unwrap();
        StreamFeatures::try_from(Stanza::from_element(element)).unwrap()
    }

    const NONE: &str = "<features xmlns='http://etherx.jabber.org/streams'/>";
    const OPTIONAL: &str = "<features xmlns='http://etherx.jabber.org/streams'>\
        <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></features>";
    const REQUIRED: &str = "<features xmlns='http://etherx.jabber.org/streams'>\
        <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls></features>";

    #[test]
    fn test_required_but_not_offered() {
        assert!(matches!(
            should_upgrade(TlsPolicy::Required, &features(NONE)),
            Err(Error::Negotiation(_))
        ));
    }

    #[test]
    fn test_off_but_required_by_server() {
        assert!(matches!(
            should_upgrade(TlsPolicy::Off, &features(REQUIRED)),
            Err(Error::Negotiation(_))
        ));
        assert!(!should_upgrade(TlsPolicy::Off, &features(OPTIONAL)).unwrap());
    }

    #[test]
    fn test_upgrade_when_offered() {
        assert!(should_upgrade(TlsPolicy::On, &features(OPTIONAL)).unwrap());
        assert!(should_upgrade(TlsPolicy::Required, &features(REQUIRED)).unwrap());
        assert!(!should_upgrade(TlsPolicy::On, &features(NONE)).unwrap());
    }
}
