//! Stream framing elements: the opening header, features and stream errors.

use std::ops::Deref;

use minidom::Element;

use super::{Stanza, StanzaKind};
use crate::{ns, Error};

const XML_LANG: &str = "xml:lang";

/// The `<stream:stream>` opening element.
///
/// Serializes as a deliberately unclosed opening tag: the framing element
/// stays open for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHeader {
    stanza: Stanza,
    default_ns: String,
}

impl StreamHeader {
    /// A version 1.0 header for the given default namespace (`jabber:client`
    /// or `jabber:server`).
    pub fn new(default_ns: &str) -> Result<Self, Error> {
        if !ns::is_stanza_ns(default_ns) {
            return Err(Error::malformed(format!(
                "invalid stream namespace '{}'",
                default_ns
            )));
        }
        let mut stanza = Stanza::new("stream", ns::STREAM);
        stanza.set_attr("version", Some("1.0"));
        stanza.set_attr(XML_LANG, Some("en"));
        Ok(Self {
            stanza,
            default_ns: default_ns.to_string(),
        })
    }

    /// A client header addressed to `domain`.
    pub fn client(domain: &str) -> Self {
        let mut stanza = Stanza::new("stream", ns::STREAM);
        stanza.set_attr("to", Some(domain));
        stanza.set_attr("version", Some("1.0"));
        stanza.set_attr(XML_LANG, Some("en"));
        Self {
            stanza,
            default_ns: ns::JABBER_CLIENT.to_string(),
        }
    }

    /// Wrap a parsed header element together with the default namespace
    /// declared on the wire.
    pub fn from_element(element: Element, default_ns: &str) -> Result<Self, Error> {
        if element.name() != "stream" || element.ns() != ns::STREAM {
            return Err(Error::malformed(format!(
                "expected stream header, got {{{}}}{}",
                element.ns(),
                element.name()
            )));
        }
        if !ns::is_stanza_ns(default_ns) {
            return Err(Error::malformed(format!(
                "invalid stream namespace '{}'",
                default_ns
            )));
        }
        Ok(Self {
            stanza: Stanza::from_element(element),
            default_ns: default_ns.to_string(),
        })
    }

    pub fn default_ns(&self) -> &str {
        &self.default_ns
    }

    pub fn to_attr(&self) -> Option<&str> {
        self.stanza.attr("to")
    }

    pub fn set_to_attr(&mut self, to: Option<&str>) {
        self.stanza.set_attr("to", to);
    }

    pub fn from_attr(&self) -> Option<&str> {
        self.stanza.attr("from")
    }

    pub fn set_from_attr(&mut self, from: Option<&str>) {
        self.stanza.set_attr("from", from);
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stanza.attr("id")
    }

    pub fn set_stream_id(&mut self, id: Option<&str>) {
        self.stanza.set_attr("id", id);
    }

    pub fn version(&self) -> Option<&str> {
        self.stanza.attr("version")
    }

    pub fn set_version(&mut self, version: Option<&str>) {
        self.stanza.set_attr("version", version);
    }

    pub fn lang(&self) -> Option<&str> {
        self.stanza.attr(XML_LANG)
    }

    pub fn set_lang(&mut self, lang: Option<&str>) {
        self.stanza.set_attr(XML_LANG, lang);
    }

    /// Validate the header per RFC 6120: only version 1.0 is spoken.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(version) = self.version() {
            if version != "1.0" {
                return Err(Error::negotiation(format!(
                    "Unsupported XMPP version: {}",
                    version
                )));
            }
        }
        Ok(())
    }

    /// The opening tag, never self-closed.
    pub fn to_xml(&self) -> String {
        let mut header = format!(
            "<stream:stream xmlns:stream='{}' xmlns='{}'",
            ns::STREAM,
            escape_attr(&self.default_ns)
        );
        let attrs = [
            (XML_LANG, self.lang()),
            ("version", self.version()),
            ("to", self.to_attr()),
            ("from", self.from_attr()),
            ("id", self.stream_id()),
        ];
        for (name, value) in attrs {
            if let Some(value) = value {
                header.push_str(&format!(" {}='{}'", name, escape_attr(value)));
            }
        }
        header.push('>');
        header
    }

    pub fn into_stanza(self) -> Stanza {
        self.stanza
    }
}

impl TryFrom<Stanza> for StreamHeader {
    type Error = Error;

    /// Generic stanzas do not carry the wire's default namespace; the client
    /// namespace is assumed.
    fn try_from(stanza: Stanza) -> Result<Self, Self::Error> {
        Self::from_element(stanza.into_element(), ns::JABBER_CLIENT)
    }
}

impl Deref for StreamHeader {
    type Target = Stanza;

    fn deref(&self) -> &Self::Target {
        &self.stanza
    }
}

/// `<stream:features/>` advertised by the server after each stream (re)open.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFeatures(Stanza);

impl StreamFeatures {
    pub fn new() -> Self {
        Self(Stanza::new("features", ns::STREAM))
    }

    /// The advertised feature element `{ns}name`, if any.
    pub fn get_feature(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.0
            .element()
            .children()
            .find(|c| c.name() == name && c.ns() == namespace)
    }

    pub fn has_feature(&self, name: &str, namespace: &str) -> bool {
        self.get_feature(name, namespace).is_some()
    }

    /// Add a feature element (mostly for tests and server-side use).
    pub fn add_feature(&mut self, feature: Element) {
        self.0.element_mut().append_child(feature);
    }

    pub fn features(&self) -> impl Iterator<Item = &Element> {
        self.0.element().children()
    }

    /// Mechanism names offered inside `<mechanisms xmlns=sasl/>`.
    pub fn sasl_mechanisms(&self) -> Vec<String> {
        self.get_feature("mechanisms", ns::SASL)
            .map(|m| {
                m.children()
                    .filter(|c| c.name() == "mechanism")
                    .map(|c| c.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for StreamFeatures {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Stanza> for StreamFeatures {
    type Error = Error;

    fn try_from(stanza: Stanza) -> Result<Self, Self::Error> {
        if stanza.kind() != StanzaKind::StreamFeatures {
            return Err(Error::malformed(format!(
                "expected stream features, got {{{}}}{}",
                stanza.ns(),
                stanza.name()
            )));
        }
        Ok(Self(stanza))
    }
}

impl Deref for StreamFeatures {
    type Target = Stanza;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A `<stream:error/>`; receiving one is fatal to the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError(Stanza);

impl StreamError {
    pub fn new(condition: &str, text: Option<&str>) -> Self {
        let mut stanza = Stanza::new("error", ns::STREAM);
        stanza.append_child(condition, ns::STREAMS);
        if let Some(text) = text {
            let mut text_elem = Element::bare("text", ns::STREAMS);
            text_elem.append_text_node(text);
            stanza.element_mut().append_child(text_elem);
        }
        Self(stanza)
    }

    /// The defined condition, `undefined-condition` when none is present.
    pub fn condition(&self) -> String {
        self.0
            .element()
            .children()
            .find(|c| c.ns() == ns::STREAMS && c.name() != "text")
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| "undefined-condition".to_string())
    }

    pub fn text(&self) -> Option<String> {
        self.0
            .get_child("text", ns::STREAMS)
            .map(|t| t.text())
            .filter(|t| !t.is_empty())
    }

    /// The equivalent [`Error::Stream`].
    pub fn to_error(&self) -> Error {
        Error::Stream {
            condition: self.condition(),
            text: self.text(),
        }
    }
}

impl TryFrom<Stanza> for StreamError {
    type Error = Error;

    fn try_from(stanza: Stanza) -> Result<Self, Self::Error> {
        if stanza.kind() != StanzaKind::StreamError {
            return Err(Error::malformed(format!(
                "expected stream error, got {{{}}}{}",
                stanza.ns(),
                stanza.name()
            )));
        }
        Ok(Self(stanza))
    }
}

impl Deref for StreamError {
    type Target = Stanza;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
