use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use minidom::Element;

use super::{expect_stanza_element, Stanza};
use crate::{ns, Error};

/// Message `type`; an absent attribute means [`MessageType::Normal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    Chat,
    Error,
    Groupchat,
    Headline,
    #[default]
    Normal,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Error => "error",
            Self::Groupchat => "groupchat",
            Self::Headline => "headline",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "error" => Ok(Self::Error),
            "groupchat" => Ok(Self::Groupchat),
            "headline" => Ok(Self::Headline),
            "normal" => Ok(Self::Normal),
            other => Err(Error::malformed(format!("invalid message type '{}'", other))),
        }
    }
}

/// A `<message/>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Message(Stanza);

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        let mut message = Self(Stanza::new("message", ns::JABBER_CLIENT));
        message.set_message_type(message_type);
        message
    }

    /// A chat message with a body.
    pub fn chat(body: &str) -> Self {
        let mut message = Self::new(MessageType::Chat);
        message.set_body(Some(body));
        message
    }

    /// The message type; unknown values read as `normal`.
    pub fn message_type(&self) -> MessageType {
        self.0
            .type_attr()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        match message_type {
            MessageType::Normal => self.0.set_attr("type", None),
            other => self.0.set_attr("type", Some(other.as_str())),
        }
    }

    pub fn body(&self) -> Option<String> {
        self.0.child_text("body")
    }

    pub fn set_body(&mut self, body: Option<&str>) {
        self.0.set_child_text("body", body);
    }

    pub fn subject(&self) -> Option<String> {
        self.0.child_text("subject")
    }

    pub fn set_subject(&mut self, subject: Option<&str>) {
        self.0.set_child_text("subject", subject);
    }

    pub fn thread(&self) -> Option<String> {
        self.0.child_text("thread")
    }

    pub fn set_thread(&mut self, thread: Option<&str>) {
        self.0.set_child_text("thread", thread);
    }

    pub fn into_stanza(self) -> Stanza {
        self.0
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Error;

    fn try_from(stanza: Stanza) -> Result<Self, Self::Error> {
        expect_stanza_element(stanza.element(), "message")?;
        Ok(Self(stanza))
    }
}

impl TryFrom<Element> for Message {
    type Error = Error;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        Self::try_from(Stanza::from_element(element))
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        message.0
    }
}

impl Deref for Message {
    type Target = Stanza;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
