//! SASL authentication (RFC 6120 section 6).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use minidom::Element;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tracing::{debug, instrument, warn};

use crate::predicate::Predicate;
use crate::stanza::Stanza;
use crate::stream::Stream;
use crate::{ns, Error};

/// Runs the authentication exchange given the server's
/// `<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>` feature.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        stream: &Stream,
        mechanisms: &Element,
        timeout: Duration,
    ) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

pub fn select_mechanism(server_mechanisms: &HashSet<String>) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

/// Mechanism names listed in a `<mechanisms/>` feature.
pub fn offered_mechanisms(mechanisms: &Element) -> HashSet<String> {
    mechanisms
        .children()
        .filter(|c| c.name() == "mechanism")
        .map(|c| c.text().trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, Error> {
    match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                Error::negotiation(format!("failed to initialize SCRAM-SHA-256: {e:?}"))
            }),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| Error::negotiation(format!("failed to initialize SCRAM-SHA-1: {e:?}"))),
        SelectedMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| Error::negotiation(format!("failed to initialize PLAIN: {e:?}"))),
    }
}

/// Payloads are base64; an empty payload is sent as `=`.
fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        BASE64_STANDARD.encode(data)
    }
}

fn decode_payload(stanza: &Stanza) -> Result<Vec<u8>, Error> {
    let text = stanza.element().text();
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(text)
        .map_err(|e| Error::negotiation(format!("invalid base64 in SASL {}: {}", stanza.name(), e)))
}

pub(crate) fn map_failure(failure: &Stanza) -> Error {
    let condition = failure
        .element()
        .children()
        .find(|c| c.name() != "text")
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| "not-authorized".to_string());
    let text = failure
        .get_child("text", ns::SASL)
        .map(|t| t.text())
        .unwrap_or_default();

    if text.is_empty() {
        Error::negotiation(format!("SASL authentication failed: {condition}"))
    } else {
        Error::negotiation(format!("SASL authentication failed: {condition}: {text}"))
    }
}

/// Authenticates with the strongest of SCRAM-SHA-256, SCRAM-SHA-1 and PLAIN
/// offered by the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaslAuthenticator;

#[async_trait]
impl Authenticator for SaslAuthenticator {
    #[instrument(skip_all, name = "xmpp.negotiation.sasl")]
    async fn authenticate(
        &self,
        stream: &Stream,
        mechanisms: &Element,
        timeout: Duration,
    ) -> Result<(), Error> {
        let server_mechanisms = offered_mechanisms(mechanisms);
        debug!(mechanisms = ?server_mechanisms, "server advertised SASL mechanisms");

        let selected = select_mechanism(&server_mechanisms).ok_or_else(|| {
            Error::negotiation(format!(
                "no supported SASL mechanism found; server offers: {}",
                server_mechanisms
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let account = stream.credentials();
        let username = account
            .jid
            .node()
            .map(|node| node.to_string())
            .ok_or_else(|| Error::negotiation("JID has no local part to authenticate with"))?;
        let credentials = Credentials::default()
            .with_username(username)
            .with_password(account.password())
            .with_channel_binding(ChannelBinding::Unsupported);

        let mut mechanism = build_mechanism(selected, &credentials)?;

        let mut outgoing = Stanza::new("auth", ns::SASL);
        outgoing.set_attr("mechanism", Some(selected.name()));
        outgoing
            .element_mut()
            .append_text_node(encode_payload(&mechanism.initial()));

        loop {
            let pending = stream.expect(vec![
                Predicate::element("challenge", Some(ns::SASL)),
                Predicate::element("success", Some(ns::SASL)),
                Predicate::element("failure", Some(ns::SASL)),
            ])?;
            stream.send(&outgoing).await?;
            let reply = pending.wait(timeout).await?;

            match reply.name() {
                "challenge" => {
                    let challenge = decode_payload(&reply)?;
                    let response = mechanism.response(&challenge).map_err(|e| {
                        Error::negotiation(format!("SASL challenge-response failed: {e:?}"))
                    })?;
                    outgoing = Stanza::new("response", ns::SASL);
                    outgoing
                        .element_mut()
                        .append_text_node(encode_payload(&response));
                }
                "success" => {
                    let data = decode_payload(&reply)?;
                    if let Err(e) = mechanism.success(&data) {
                        warn!(error = ?e, "server signature verification failed");
                        return Err(Error::negotiation(format!(
                            "server signature verification failed: {e:?}"
                        )));
                    }
                    debug!("SASL authentication succeeded");
                    return Ok(());
                }
                _ => {
                    let error = map_failure(&reply);
                    debug!(error = %error, "SASL authentication failed");
                    return Err(error);
                }
            }
        }
    }
}
