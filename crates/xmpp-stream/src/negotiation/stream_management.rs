//! Stream management enablement (XEP-0198).

use std::time::Duration;

use minidom::Element;
use tracing::{debug, instrument};

use crate::predicate::Predicate;
use crate::stanza::{Stanza, StanzaError};
use crate::stream::Stream;
use crate::{ns, Error};

/// What the client asks for when enabling stream management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamManagementOptions {
    /// Request a resumable session.
    pub resume: bool,
}

/// The session the server granted in `<enabled/>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamManagementSession {
    /// Stream id used to resume (`previd`).
    pub id: Option<String>,
    /// Preferred reconnection address.
    pub location: Option<String>,
    pub resume: bool,
    /// Maximum time the server keeps the session resumable.
    pub max_resume_time: Option<Duration>,
}

impl StreamManagementSession {
    pub fn from_enabled(enabled: &Element) -> Self {
        let non_empty = |name: &str| {
            enabled
                .attr(name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            id: non_empty("id"),
            location: non_empty("location"),
            resume: matches!(enabled.attr("resume"), Some("1") | Some("true")),
            max_resume_time: enabled
                .attr("max")
                .and_then(|m| m.parse::<u64>().ok())
                .map(Duration::from_secs),
        }
    }
}

pub fn enable_request(options: StreamManagementOptions) -> Stanza {
    let mut enable = Stanza::new("enable", ns::SM);
    if options.resume {
        enable.set_attr("resume", Some("true"));
    }
    enable
}

#[instrument(skip(stream), name = "xmpp.negotiation.stream_management")]
pub async fn enable(
    stream: &Stream,
    options: StreamManagementOptions,
    timeout: Duration,
) -> Result<StreamManagementSession, Error> {
    let pending = stream.expect(vec![
        Predicate::element("enabled", Some(ns::SM)),
        Predicate::element("failed", Some(ns::SM)),
    ])?;
    stream.send(&enable_request(options)).await?;

    let reply = pending.wait(timeout).await?;
    if reply.name() == "failed" {
        return Err(Error::Stanza(StanzaError::from_element(reply.element())));
    }

    let session = StreamManagementSession::from_enabled(reply.element());
    debug!(id = ?session.id, resume = session.resume, "Stream management enabled");
    Ok(session)
}
