//! Namespace URIs used by the stream core.

/// XMPP client namespace
pub const JABBER_CLIENT: &str = "jabber:client";
/// XMPP server namespace
pub const JABBER_SERVER: &str = "jabber:server";
/// XMPP streams namespace
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// STARTTLS namespace
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// SASL namespace
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// Resource binding namespace
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Legacy session establishment namespace (RFC 3921)
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// Stanza error namespace
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// Stream error namespace
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// Stream management (XEP-0198)
pub const SM: &str = "urn:xmpp:sm:3";
/// In-band registration stream feature (XEP-0077)
pub const REGISTER_FEATURE: &str = "http://jabber.org/features/iq-register";
/// In-band registration query (XEP-0077)
pub const REGISTER: &str = "jabber:iq:register";

/// Whether `ns` is one of the stanza-carrying default namespaces.
pub fn is_stanza_ns(ns: &str) -> bool {
    ns == JABBER_CLIENT || ns == JABBER_SERVER
}
