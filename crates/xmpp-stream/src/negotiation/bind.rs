//! Resource binding (RFC 6120 section 7).

use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tracing::{debug, instrument};

use crate::stanza::{Iq, IqType};
use crate::stream::Stream;
use crate::{ns, Error};

/// Build the `<bind/>` payload, requesting `resource` when given.
pub fn bind_request(resource: Option<&str>) -> Iq {
    let mut bind = Element::bare("bind", ns::BIND);
    if let Some(resource) = resource {
        let mut child = Element::bare("resource", ns::BIND);
        child.append_text_node(resource);
        bind.append_child(child);
    }
    let mut iq = Iq::new(IqType::Set);
    iq.set_payload(bind);
    iq
}

/// The JID assigned in a bind result.
pub fn bound_jid(reply: &Iq) -> Result<Jid, Error> {
    let text = reply
        .payload()
        .filter(|p| p.is("bind", ns::BIND))
        .and_then(|bind| bind.get_child("jid", ns::BIND))
        .map(|jid| jid.text())
        .ok_or_else(|| Error::negotiation("invalid response to resource binding"))?;
    Jid::new(text.trim()).map_err(|e| Error::Jid(e.to_string()))
}

/// Bind a resource. When the server assigns a different resource than the
/// one requested, the stream's JID is replaced with the bound one.
#[instrument(skip(stream), name = "xmpp.negotiation.bind")]
pub async fn bind(stream: &Stream, timeout: Duration) -> Result<Jid, Error> {
    let jid = stream.jid();
    let requested = jid.resource().map(|r| r.to_string());

    let request = bind_request(requested.as_deref());
    let reply = stream
        .send_and_wait(request.into_stanza(), true, Some(timeout))
        .await?;
    let bound = bound_jid(&Iq::try_from(reply)?)?;

    let assigned = bound.resource().map(|r| r.to_string());
    if assigned != requested {
        debug!(requested = ?requested, assigned = ?assigned, "Server assigned a different resource");
        stream.set_jid(bound);
    }
    Ok(stream.jid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Stanza;

    #[test]
    fn test_bind_request_with_resource() {
        let iq = bind_request(Some("phone"));
        assert_eq!(iq.iq_type(), IqType::Set);
        assert!(iq.id().is_some());
        let bind = iq.payload().unwrap();
        assert_eq!(bind.get_child("resource", ns::BIND).unwrap().text(), "phone");

        let iq = bind_request(None);
        assert!(!iq.payload().unwrap().has_child("resource", ns::BIND));
    }

    #[test]
    fn test_bound_jid() {
        let element: Element = "<iq xmlns='jabber:client' type='result' id='b'>\
            <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.com/4db06f06</jid></bind></iq>"
            .parse()
            .unwrap();
        let iq = Iq::try_from(Stanza::from_element(element)).unwrap();
        let jid = bound_jid(&iq).unwrap();
        assert_eq!(jid.to_string(), "alice@example.com/4db06f06");
    }

    #[test]
    fn test_bound_jid_missing() {
        let element: Element = "<iq xmlns='jabber:client' type='result' id='b'/>".parse().unwrap();
        let iq = Iq::try_from(Stanza::from_element(element)).unwrap();
        assert!(matches!(bound_jid(&iq), Err(Error::Negotiation(_))));
    }
}
