use std::cmp::Ordering;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use minidom::Element;

use super::{expect_stanza_element, Stanza};
use crate::{ns, Error};

/// Presence `<show/>` values.
///
/// An absent `<show/>` ranks between [`Show::Chat`] and [`Show::Away`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Show {
    Chat,
    Away,
    Xa,
    Dnd,
}

impl Show {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Away => "away",
            Self::Xa => "xa",
            Self::Dnd => "dnd",
        }
    }

    /// Position in the availability table, 0 being the most available.
    fn rank(show: Option<Show>) -> u8 {
        match show {
            Some(Self::Chat) => 0,
            None => 1,
            Some(Self::Away) => 2,
            Some(Self::Xa) => 3,
            Some(Self::Dnd) => 4,
        }
    }
}

impl fmt::Display for Show {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Show {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "away" => Ok(Self::Away),
            "xa" => Ok(Self::Xa),
            "dnd" => Ok(Self::Dnd),
            other => Err(Error::malformed(format!("invalid presence show '{}'", other))),
        }
    }
}

/// Presence `type`; an absent attribute means [`PresenceType::Available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceType {
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Unavailable => "unavailable",
            Self::Subscribe => "subscribe",
            Self::Subscribed => "subscribed",
            Self::Unsubscribe => "unsubscribe",
            Self::Unsubscribed => "unsubscribed",
            Self::Probe => "probe",
            Self::Error => "error",
        }
    }
}

impl FromStr for PresenceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "unavailable" => Ok(Self::Unavailable),
            "subscribe" => Ok(Self::Subscribe),
            "subscribed" => Ok(Self::Subscribed),
            "unsubscribe" => Ok(Self::Unsubscribe),
            "unsubscribed" => Ok(Self::Unsubscribed),
            "probe" => Ok(Self::Probe),
            "error" => Ok(Self::Error),
            other => Err(Error::malformed(format!("invalid presence type '{}'", other))),
        }
    }
}

/// Availability ranking key of a presence: `(priority, show-rank)`.
///
/// Greater means more available: a higher priority wins, and on equal
/// priority the show table `chat > none > away > xa > dnd` decides. A missing
/// priority counts as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    priority: i8,
    show: Option<Show>,
}

impl Availability {
    pub fn new(priority: i8, show: Option<Show>) -> Self {
        Self { priority, show }
    }
}

impl Ord for Availability {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| Show::rank(other.show).cmp(&Show::rank(self.show)))
    }
}

impl PartialOrd for Availability {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A `<presence/>` stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence(Stanza);

impl Presence {
    /// An available presence with no show, status or priority.
    pub fn new() -> Self {
        Self(Stanza::new("presence", ns::JABBER_CLIENT))
    }

    pub fn with_type(presence_type: PresenceType) -> Self {
        let mut presence = Self::new();
        presence.set_presence_type(presence_type);
        presence
    }

    pub fn presence_type(&self) -> PresenceType {
        self.0
            .type_attr()
            .and_then(|t| t.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_presence_type(&mut self, presence_type: PresenceType) {
        match presence_type {
            PresenceType::Available => self.0.set_attr("type", None),
            other => self.0.set_attr("type", Some(other.as_str())),
        }
    }

    /// Priority in the open range (-128, 127); unparsable values read as `None`.
    pub fn priority(&self) -> Option<i8> {
        self.0
            .child_text("priority")
            .and_then(|t| t.trim().parse::<i8>().ok())
            .filter(|p| *p != i8::MIN && *p != i8::MAX)
    }

    pub fn set_priority(&mut self, priority: Option<i8>) -> Result<(), Error> {
        match priority {
            Some(p) if p == i8::MIN || p == i8::MAX => Err(Error::malformed(format!(
                "priority {} out of range: -128 < priority < 127",
                p
            ))),
            Some(p) => {
                self.0.set_child_text("priority", Some(&p.to_string()));
                Ok(())
            }
            None => {
                self.0.set_child_text("priority", None);
                Ok(())
            }
        }
    }

    /// The `<show/>` value; unknown values read as `None`.
    pub fn show(&self) -> Option<Show> {
        self.0.child_text("show").and_then(|s| s.parse().ok())
    }

    pub fn set_show(&mut self, show: Option<Show>) {
        self.0.set_child_text("show", show.map(|s| s.as_str()));
    }

    pub fn status(&self) -> Option<String> {
        self.0.child_text("status")
    }

    pub fn set_status(&mut self, status: Option<&str>) {
        self.0.set_child_text("status", status);
    }

    pub fn availability(&self) -> Availability {
        Availability::new(self.priority().unwrap_or(0), self.show())
    }

    pub fn into_stanza(self) -> Stanza {
        self.0
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Error;

    fn try_from(stanza: Stanza) -> Result<Self, Self::Error> {
        expect_stanza_element(stanza.element(), "presence")?;
        Ok(Self(stanza))
    }
}

impl TryFrom<Element> for Presence {
    type Error = Error;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        Self::try_from(Stanza::from_element(element))
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        presence.0
    }
}

impl Deref for Presence {
    type Target = Stanza;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Presence {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
