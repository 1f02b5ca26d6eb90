use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use minidom::Element;

use super::{expect_stanza_element, Stanza};
use crate::{ns, Error};

/// The mandatory `type` of an `<iq/>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IqType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Self::Get),
            "set" => Ok(Self::Set),
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            other => Err(Error::malformed(format!("invalid iq type '{}'", other))),
        }
    }
}

/// An `<iq/>` request or response.
///
/// Besides an optional `<error/>` an iq carries at most one payload child.
#[derive(Debug, Clone, PartialEq)]
pub struct Iq(Stanza);

impl Iq {
    /// Create an iq of the given type with a freshly generated id.
    pub fn new(iq_type: IqType) -> Self {
        let mut stanza = Stanza::new("iq", ns::JABBER_CLIENT);
        stanza.set_attr("type", Some(iq_type.as_str()));
        // Prefix-free ids cannot fail.
        if let Ok(id) = super::next_id(None) {
            stanza.set_attr("id", Some(&id));
        }
        Self(stanza)
    }

    /// Create an iq carrying a single empty `<name xmlns=ns/>` payload.
    pub fn request(iq_type: IqType, name: &str, namespace: &str) -> Self {
        let mut iq = Self::new(iq_type);
        iq.0.append_child(name, namespace);
        iq
    }

    pub fn iq_type(&self) -> IqType {
        self.0
            .type_attr()
            .and_then(|t| t.parse().ok())
            .unwrap_or(IqType::Get)
    }

    pub fn set_iq_type(&mut self, iq_type: IqType) {
        self.0.set_attr("type", Some(iq_type.as_str()));
    }

    /// The payload child: the first child that is not the `<error/>`.
    pub fn payload(&self) -> Option<&Element> {
        let ns = self.0.ns();
        self.0
            .element()
            .children()
            .find(|c| !(c.name() == "error" && c.ns() == ns))
    }

    /// Replace the payload with `payload`, keeping any `<error/>` child.
    pub fn set_payload(&mut self, payload: Element) {
        let error = self.0.error();
        self.0.clear_children();
        self.0.element_mut().append_child(payload);
        self.0.set_error(error.as_ref());
    }

    pub fn into_stanza(self) -> Stanza {
        self.0
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Error;

    fn try_from(stanza: Stanza) -> Result<Self, Self::Error> {
        expect_stanza_element(stanza.element(), "iq")?;
        match stanza.type_attr() {
            Some(t) => {
                t.parse::<IqType>()?;
            }
            None => return Err(Error::malformed("iq without a type attribute")),
        }
        let ns = stanza.ns();
        let payloads = stanza
            .element()
            .children()
            .filter(|c| !(c.name() == "error" && c.ns() == ns))
            .count();
        if payloads > 1 {
            return Err(Error::malformed(format!(
                "iq carries {} payload children, at most one allowed",
                payloads
            )));
        }
        Ok(Self(stanza))
    }
}

impl TryFrom<Element> for Iq {
    type Error = Error;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        Self::try_from(Stanza::from_element(element))
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        iq.0
    }
}

impl Deref for Iq {
    type Target = Stanza;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Iq {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{StanzaError, StanzaErrorCondition, StanzaErrorType};

    #[test]
    fn test_new_iq_has_id_and_type() {
        let iq = Iq::new(IqType::Get);
        assert!(iq.id().is_some_and(|id| !id.is_empty()));
        assert_eq!(iq.iq_type(), IqType::Get);
        assert_ne!(iq.id(), Iq::new(IqType::Get).id());
    }

    #[test]
    fn test_request_payload() {
        let iq = Iq::request(IqType::Set, "bind", ns::BIND);
        let payload = iq.payload().unwrap();
        assert_eq!(payload.name(), "bind");
        assert_eq!(payload.ns(), ns::BIND);
    }

    #[test]
    fn test_payload_skips_error() {
        let element: Element = "<iq xmlns='jabber:client' type='error' id='1'>\
            <error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>\
            <query xmlns='jabber:iq:roster'/></iq>"
            .parse()
            .unwrap();
        let iq = Iq::try_from(element).unwrap();
        assert_eq!(iq.payload().map(|p| p.name()), Some("query"));
        assert_eq!(
            iq.error().map(|e| e.condition),
            Some(StanzaErrorCondition::ItemNotFound)
        );
    }

    #[test]
    fn test_set_payload_keeps_error() {
        let mut iq = Iq::request(IqType::Get, "query", "jabber:iq:version");
        iq.set_error(Some(&StanzaError::new(
            StanzaErrorType::Modify,
            StanzaErrorCondition::BadRequest,
        )));
        iq.set_payload(Element::bare("vCard", "vcard-temp"));

        assert_eq!(iq.payload().map(|p| p.name()), Some("vCard"));
        assert!(iq.error().is_some());
    }

    #[test]
    fn test_wrap_validates_tag_and_type() {
        let message: Element = "<message xmlns='jabber:client'/>".parse().unwrap();
        assert!(matches!(
            Iq::try_from(message),
            Err(Error::MalformedStanza(_))
        ));

        let untyped: Element = "<iq xmlns='jabber:client' id='x'/>".parse().unwrap();
        assert!(matches!(
            Iq::try_from(untyped),
            Err(Error::MalformedStanza(_))
        ));

        let bogus: Element = "<iq xmlns='jabber:client' type='fetch'/>".parse().unwrap();
        assert!(Iq::try_from(bogus).is_err());
    }

    #[test]
    fn test_wrap_rejects_second_payload() {
        let element: Element = "<iq xmlns='jabber:client' type='set' id='2'>\
            <query xmlns='jabber:iq:roster'/><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>"
            .parse()
            .unwrap();
        assert!(matches!(
            Iq::try_from(element),
            Err(Error::MalformedStanza(_))
        ));

        let empty: Element = "<iq xmlns='jabber:client' type='result' id='3'/>".parse().unwrap();
        assert!(Iq::try_from(empty).unwrap().payload().is_none());
    }
}
