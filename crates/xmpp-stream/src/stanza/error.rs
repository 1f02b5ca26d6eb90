//! Stanza-level error payloads (RFC 6120 Section 8.3).

use std::fmt;
use std::str::FromStr;

use minidom::Element;

use crate::ns;

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Gone (entity no longer available)
    Gone,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Redirect
    Redirect,
    /// Registration required
    RegistrationRequired,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

const CONDITIONS: &[StanzaErrorCondition] = &[
    StanzaErrorCondition::BadRequest,
    StanzaErrorCondition::Conflict,
    StanzaErrorCondition::FeatureNotImplemented,
    StanzaErrorCondition::Forbidden,
    StanzaErrorCondition::Gone,
    StanzaErrorCondition::InternalServerError,
    StanzaErrorCondition::ItemNotFound,
    StanzaErrorCondition::JidMalformed,
    StanzaErrorCondition::NotAcceptable,
    StanzaErrorCondition::NotAllowed,
    StanzaErrorCondition::NotAuthorized,
    StanzaErrorCondition::PolicyViolation,
    StanzaErrorCondition::RecipientUnavailable,
    StanzaErrorCondition::Redirect,
    StanzaErrorCondition::RegistrationRequired,
    StanzaErrorCondition::RemoteServerNotFound,
    StanzaErrorCondition::RemoteServerTimeout,
    StanzaErrorCondition::ResourceConstraint,
    StanzaErrorCondition::ServiceUnavailable,
    StanzaErrorCondition::SubscriptionRequired,
    StanzaErrorCondition::UndefinedCondition,
    StanzaErrorCondition::UnexpectedRequest,
];

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StanzaErrorCondition {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CONDITIONS.iter().find(|c| c.as_str() == s).copied().ok_or(())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Proceed (the condition was only a warning)
    Continue,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StanzaErrorType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "cancel" => Ok(Self::Cancel),
            "continue" => Ok(Self::Continue),
            "modify" => Ok(Self::Modify),
            "wait" => Ok(Self::Wait),
            _ => Err(()),
        }
    }
}

/// The `<error/>` payload of an `iq`, `message` or `presence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaError {
    /// Error type
    pub error_type: StanzaErrorType,
    /// Defined condition
    pub condition: StanzaErrorCondition,
    /// Optional text description
    pub text: Option<String>,
}

impl StanzaError {
    /// Create a new stanza error without descriptive text.
    pub fn new(error_type: StanzaErrorType, condition: StanzaErrorCondition) -> Self {
        Self {
            error_type,
            condition,
            text: None,
        }
    }

    /// Attach descriptive text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Read an error from an `<error/>` element.
    ///
    /// Unknown conditions map to `undefined-condition`, a missing or unknown
    /// type to `cancel`.
    pub fn from_element(element: &Element) -> Self {
        let error_type = element
            .attr("type")
            .and_then(|t| t.parse().ok())
            .unwrap_or(StanzaErrorType::Cancel);

        let mut condition = StanzaErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in element.children() {
            if child.ns() != ns::STANZAS {
                continue;
            }
            if child.name() == "text" {
                let t = child.text();
                if !t.is_empty() {
                    text = Some(t);
                }
            } else if let Ok(c) = child.name().parse() {
                condition = c;
            }
        }

        Self {
            error_type,
            condition,
            text,
        }
    }

    /// Render as an `<error/>` element in the given stanza namespace.
    pub fn to_element(&self, stanza_ns: &str) -> Element {
        let mut error = Element::builder("error", stanza_ns)
            .attr("type", self.error_type.as_str())
            .append(Element::bare(self.condition.as_str(), ns::STANZAS))
            .build();
        if let Some(text) = &self.text {
            let mut text_elem = Element::bare("text", ns::STANZAS);
            text_elem.append_text_node(text.as_str());
            error.append_child(text_elem);
        }
        error
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type)?;
        if let Some(text) = &self.text {
            write!(f, ": {}", text)?;
        }
        Ok(())
    }
}
