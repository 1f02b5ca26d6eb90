//! Legacy session establishment (RFC 3921 section 3).

use std::time::Duration;

use serde::Deserialize;
use tracing::instrument;

use crate::stanza::{IqType, StreamFeatures};
use crate::stream::Stream;
use crate::{ns, Error};

/// When to send the legacy `<session/>` request.
///
/// RFC 6120 dropped the session step, but older servers still advertise
/// and sometimes require it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicy {
    /// When advertised and not marked `<optional/>`.
    #[default]
    Auto,
    /// Whenever advertised.
    Always,
    Never,
}

impl std::str::FromStr for SessionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SessionPolicy::Auto),
            "always" => Ok(SessionPolicy::Always),
            "never" => Ok(SessionPolicy::Never),
            other => Err(Error::Config(format!("Invalid session policy: {}", other))),
        }
    }
}

pub fn should_start(policy: SessionPolicy, features: &StreamFeatures) -> bool {
    match (policy, features.get_feature("session", ns::SESSION)) {
        (_, None) | (SessionPolicy::Never, _) => false,
        (SessionPolicy::Always, Some(_)) => true,
        (SessionPolicy::Auto, Some(feature)) => !feature.has_child("optional", ns::SESSION),
    }
}

#[instrument(skip(stream), name = "xmpp.negotiation.session")]
pub async fn start(stream: &Stream, timeout: Duration) -> Result<(), Error> {
    stream
        .send_and_wait_iq(ns::SESSION, None, "session", IqType::Set, true, Some(timeout))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Stanza;
    use minidom::Element;

    fn features(session: &str) -> StreamFeatures {
        let xml = format!(
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>{}</features>",
            session
        );
        let element: Element = xml.parse().unwrap();
        StreamFeatures::try_from(Stanza::from_element(element)).unwrap()
    }

    const SESSION: &str = "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>";
    const OPTIONAL: &str =
        "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>";

    #[test]
    fn test_policies() {
        assert!(should_start(SessionPolicy::Auto, &features(SESSION)));
        assert!(!should_start(SessionPolicy::Auto, &features(OPTIONAL)));
        assert!(should_start(SessionPolicy::Always, &features(OPTIONAL)));
        assert!(!should_start(SessionPolicy::Never, &features(SESSION)));
        assert!(!should_start(SessionPolicy::Always, &features("")));
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("never".parse::<SessionPolicy>().unwrap(), SessionPolicy::Never);
        assert!("sometimes".parse::<SessionPolicy>().is_err());
    }
}
