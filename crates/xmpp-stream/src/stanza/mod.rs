//! Typed stanza wrappers over minidom elements.
//!
//! A [`Stanza`] owns one top-level element of the stream. The specialized
//! wrappers ([`Iq`], [`Presence`], [`Message`], [`StreamHeader`],
//! [`StreamFeatures`], [`StreamError`]) validate the element on construction
//! and add protocol-specific accessors; they dereference to [`Stanza`] for the
//! common `to`/`from`/`id`/`type`/`error` fields.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use jid::Jid;
use minidom::{Element, Node};

use crate::{ns, Error};

mod error;
mod iq;
mod message;
mod presence;
mod stream;

pub use error::{StanzaError, StanzaErrorCondition, StanzaErrorType};
pub use iq::{Iq, IqType};
pub use message::{Message, MessageType};
pub use presence::{Availability, Presence, PresenceType, Show};
pub use stream::{StreamError, StreamFeatures, StreamHeader};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static SESSION_TOKEN: OnceLock<String> = OnceLock::new();

fn session_token() -> &'static str {
    SESSION_TOKEN.get_or_init(|| {
        let uuid = uuid::Uuid::new_v4().to_string();
        uuid.split('-').next().unwrap_or_default().to_string()
    })
}

/// Generate a stanza id of the form `[prefix:]<session-token>-<counter>`.
///
/// The token is fixed for the process and the counter is monotonic, so ids are
/// unique per sender for the lifetime of the process.
pub fn next_id(prefix: Option<&str>) -> Result<String, Error> {
    let counter = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    match prefix {
        Some(p) if p.contains(':') => Err(Error::malformed(format!(
            "id prefix cannot contain ':' ({})",
            p
        ))),
        Some(p) if !p.is_empty() => Ok(format!("{}:{}-{}", p, session_token(), counter)),
        _ => Ok(format!("{}-{}", session_token(), counter)),
    }
}

/// Coarse classification of a top-level element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Iq,
    Message,
    Presence,
    StreamHeader,
    StreamFeatures,
    StreamError,
    /// Any other top-level element (SASL, STARTTLS, stream management nonzas...)
    Other,
}

/// A top-level stream element plus derived addressing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
}

impl Stanza {
    /// Create an empty stanza element.
    pub fn new(name: &str, ns: &str) -> Self {
        Self {
            element: Element::bare(name, ns),
        }
    }

    /// Create a stanza with the given attributes; empty values are skipped.
    pub fn with_attrs<'a>(
        name: &str,
        ns: &str,
        attrs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut stanza = Self::new(name, ns);
        for (attr, value) in attrs {
            stanza.set_attr(attr, Some(value));
        }
        stanza
    }

    /// Wrap an existing element without validation.
    pub fn from_element(element: Element) -> Self {
        Self { element }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn element_mut(&mut self) -> &mut Element {
        &mut self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    /// Local name of the element.
    pub fn name(&self) -> &str {
        self.element.name()
    }

    /// Namespace of the element.
    pub fn ns(&self) -> String {
        self.element.ns()
    }

    /// Whether the element has the given name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.element.name() == name && self.element.ns() == namespace
    }

    pub fn kind(&self) -> StanzaKind {
        let ns = self.element.ns();
        match self.element.name() {
            "iq" if ns::is_stanza_ns(&ns) => StanzaKind::Iq,
            "message" if ns::is_stanza_ns(&ns) => StanzaKind::Message,
            "presence" if ns::is_stanza_ns(&ns) => StanzaKind::Presence,
            "stream" if ns == ns::STREAM => StanzaKind::StreamHeader,
            "features" if ns == ns::STREAM => StanzaKind::StreamFeatures,
            "error" if ns == ns::STREAM => StanzaKind::StreamError,
            _ => StanzaKind::Other,
        }
    }

    /// Attribute value; empty attributes read as absent.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name).filter(|v| !v.is_empty())
    }

    /// Set an attribute; `None` or an empty value removes it.
    pub fn set_attr(&mut self, name: &str, value: Option<&str>) {
        match value.filter(|v| !v.is_empty()) {
            Some(v) => self.element.set_attr(name, v),
            None => {
                if self.element.attr(name).is_some() {
                    self.element = rebuild(&self.element, Some(name), true);
                }
            }
        }
    }

    pub fn to_jid(&self) -> Option<Jid> {
        self.attr("to").and_then(|s| Jid::new(s).ok())
    }

    pub fn set_to_jid(&mut self, to: Option<&Jid>) {
        let value = to.map(|j| j.to_string());
        self.set_attr("to", value.as_deref());
    }

    pub fn from_jid(&self) -> Option<Jid> {
        self.attr("from").and_then(|s| Jid::new(s).ok())
    }

    pub fn set_from_jid(&mut self, from: Option<&Jid>) {
        let value = from.map(|j| j.to_string());
        self.set_attr("from", value.as_deref());
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn set_id(&mut self, id: Option<&str>) {
        self.set_attr("id", id);
    }

    /// Assign a freshly generated id (see [`next_id`]) and return it.
    pub fn generate_id(&mut self, prefix: Option<&str>) -> Result<String, Error> {
        let id = next_id(prefix)?;
        self.set_attr("id", Some(&id));
        Ok(id)
    }

    /// Raw `type` attribute.
    pub fn type_attr(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn set_type_attr(&mut self, stanza_type: Option<&str>) {
        self.set_attr("type", stanza_type);
    }

    /// Text of the first child with the given name in the stanza's namespace.
    pub fn child_text(&self, name: &str) -> Option<String> {
        let ns = self.element.ns();
        self.element.get_child(name, ns.as_str()).map(|c| c.text())
    }

    /// Replace the text child `name`; `None` or empty text removes it.
    pub fn set_child_text(&mut self, name: &str, text: Option<&str>) {
        let ns = self.element.ns();
        while self.element.remove_child(name, ns.as_str()).is_some() {}
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            let mut child = Element::bare(name, ns.as_str());
            child.append_text_node(text);
            self.element.append_child(child);
        }
    }

    /// First child element with the given name and namespace.
    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    /// Append a new empty child element and return it.
    pub fn append_child(&mut self, name: &str, namespace: &str) -> &mut Element {
        self.element.append_child(Element::bare(name, namespace))
    }

    /// The `<error/>` payload, if the stanza carries one.
    pub fn error(&self) -> Option<StanzaError> {
        let ns = self.element.ns();
        self.element
            .get_child("error", ns.as_str())
            .map(StanzaError::from_element)
    }

    /// Replace (or with `None`, remove) the `<error/>` payload.
    pub fn set_error(&mut self, error: Option<&StanzaError>) {
        let ns = self.element.ns();
        while self.element.remove_child("error", ns.as_str()).is_some() {}
        if let Some(error) = error {
            self.element.append_child(error.to_element(&ns));
        }
    }

    /// Exchange the `to` and `from` addresses; a missing side is left untouched.
    pub fn swap_to_from(&mut self) {
        let to = self.attr("to").map(str::to_string);
        let from = self.attr("from").map(str::to_string);
        if let Some(from) = &from {
            self.set_attr("to", Some(from));
        }
        if let Some(to) = &to {
            self.set_attr("from", Some(to));
        }
    }

    /// Turn this stanza into an error reply in place.
    pub fn error_response(&mut self, error: &StanzaError) -> &mut Self {
        self.clear_children();
        self.set_attr("type", Some("error"));
        self.set_error(Some(error));
        self.swap_to_from();
        self
    }

    /// Turn this stanza into a result reply in place, optionally dropping its payload.
    pub fn result_response(&mut self, clear: bool) -> &mut Self {
        self.set_attr("type", Some("result"));
        self.set_error(None);
        self.swap_to_from();
        if clear {
            self.clear_children();
        }
        self
    }

    /// Remove every child node.
    pub fn clear_children(&mut self) {
        self.element = rebuild(&self.element, None, false);
    }

    /// Serialize the element.
    pub fn to_xml(&self) -> Result<String, Error> {
        element_to_string(&self.element)
    }
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Self::from_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        stanza.element
    }
}

/// Copy `element`, dropping attribute `skip_attr` and optionally the child nodes.
fn rebuild(element: &Element, skip_attr: Option<&str>, keep_nodes: bool) -> Element {
    let mut fresh = Element::bare(element.name(), element.ns());
    for (name, value) in element.attrs() {
        if Some(name) != skip_attr {
            fresh.set_attr(name, value);
        }
    }
    if keep_nodes {
        for node in element.nodes() {
            let node: Node = node.clone();
            fresh.append_node(node);
        }
    }
    fresh
}

/// Convert a minidom Element to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, Error> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| Error::parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| Error::parse(format!("Invalid UTF-8: {}", e)))
}

/// Check that `element` is named `name` in one of the stanza namespaces.
pub(crate) fn expect_stanza_element(element: &Element, name: &str) -> Result<(), Error> {
    if element.name() != name || !ns::is_stanza_ns(&element.ns()) {
        return Err(Error::malformed(format!(
            "expected <{}/> in a stanza namespace, got {{{}}}{}",
            name,
            element.ns(),
            element.name()
        )));
    }
    Ok(())
}
