//! Structured stanza selectors used by waiters.
//!
//! A predicate is a path of steps starting at the top-level element. Each
//! step names an element (optionally namespaced, `*` for any name) and may
//! require attribute values. A step after the first matches if *any* child of
//! the element matched by the previous step satisfies it.
//!
//! ```
//! use xmpp_stream::predicate::Predicate;
//!
//! let p = Predicate::parse(
//!     "/iq[@type='result']/bind:bind",
//!     &[("bind", "urn:ietf:params:xml:ns:xmpp-bind")],
//! )
//! .unwrap();
//! assert_eq!(p.to_string(), "/iq[@type='result']/{urn:ietf:params:xml:ns:xmpp-bind}bind");
//! ```

use std::fmt;

use minidom::Element;

use crate::stanza::Stanza;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    name: Option<String>,
    ns: Option<String>,
    attrs: Vec<(String, String)>,
}

impl Step {
    fn new(name: &str, ns: Option<&str>) -> Self {
        Self {
            name: (name != "*").then(|| name.to_string()),
            ns: ns.map(str::to_string),
            attrs: Vec::new(),
        }
    }

    fn matches(&self, element: &Element) -> bool {
        if let Some(name) = &self.name {
            if element.name() != name {
                return false;
            }
        }
        if let Some(ns) = &self.ns {
            if element.ns() != *ns {
                return false;
            }
        }
        self.attrs
            .iter()
            .all(|(name, value)| element.attr(name) == Some(value.as_str()))
    }
}

/// A selector over a stanza's element tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    steps: Vec<Step>,
}

impl Predicate {
    /// Match a top-level element by name and optional namespace.
    pub fn element(name: &str, ns: Option<&str>) -> Self {
        Self {
            steps: vec![Step::new(name, ns)],
        }
    }

    /// Match any top-level element.
    pub fn any() -> Self {
        Self::element("*", None)
    }

    /// Require an attribute value on the most recently added step.
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.attrs.push((name.to_string(), value.to_string()));
        }
        self
    }

    /// Require a child (of the element matched by the last step).
    pub fn child(mut self, name: &str, ns: Option<&str>) -> Self {
        self.steps.push(Step::new(name, ns));
        self
    }

    /// Parse the compact path syntax.
    ///
    /// Steps are separated by `/`. A step is `name`, `prefix:name`,
    /// `{namespace}name` or `*`, followed by any number of `[@attr='value']`
    /// filters. Unprefixed names match any namespace; prefixes are looked up
    /// in `prefixes`.
    pub fn parse(path: &str, prefixes: &[(&str, &str)]) -> Result<Self, Error> {
        let path = path.trim();
        let body = path.strip_prefix('/').unwrap_or(path);
        let steps = split_steps(body)?
            .into_iter()
            .map(|raw| parse_step(raw, prefixes))
            .collect::<Result<Vec<_>, _>>()?;
        if steps.is_empty() {
            return Err(Error::Predicate(format!("empty predicate '{}'", path)));
        }
        Ok(Self { steps })
    }

    pub fn matches(&self, element: &Element) -> bool {
        match self.steps.split_first() {
            Some((first, rest)) => first.matches(element) && matches_children(element, rest),
            None => false,
        }
    }

    pub fn matches_stanza(&self, stanza: &Stanza) -> bool {
        self.matches(stanza.element())
    }
}

fn matches_children(element: &Element, steps: &[Step]) -> bool {
    match steps.split_first() {
        None => true,
        Some((step, rest)) => element
            .children()
            .any(|child| step.matches(child) && matches_children(child, rest)),
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            f.write_str("/")?;
            if let Some(ns) = &step.ns {
                write!(f, "{{{}}}", ns)?;
            }
            f.write_str(step.name.as_deref().unwrap_or("*"))?;
            for (name, value) in &step.attrs {
                write!(f, "[@{}='{}']", name, value)?;
            }
        }
        Ok(())
    }
}

/// Render a predicate set for error messages.
pub fn describe(predicates: &[Predicate]) -> String {
    predicates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Split on `/` outside of `{...}` and `[...]`.
fn split_steps(path: &str) -> Result<Vec<&str>, Error> {
    let mut steps = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in path.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '{' | '[') => depth += 1,
            (None, '}' | ']') => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Predicate(format!("unbalanced '{}' in '{}'", c, path)))?;
            }
            (None, '/') if depth == 0 => {
                steps.push(&path[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(Error::Predicate(format!("unterminated step in '{}'", path)));
    }
    steps.push(&path[start..]);
    if steps.iter().any(|s| s.trim().is_empty()) {
        return Err(Error::Predicate(format!("empty step in '{}'", path)));
    }
    Ok(steps)
}

fn parse_step(raw: &str, prefixes: &[(&str, &str)]) -> Result<Step, Error> {
    let raw = raw.trim();
    let (qname, mut filters) = match raw.find('[') {
        Some(i) => (&raw[..i], &raw[i..]),
        None => (raw, ""),
    };

    let mut step = if let Some(clark) = qname.strip_prefix('{') {
        let (ns, name) = clark
            .split_once('}')
            .ok_or_else(|| Error::Predicate(format!("unterminated namespace in '{}'", raw)))?;
        Step::new(name, Some(ns))
    } else if let Some((prefix, name)) = qname.split_once(':') {
        let ns = prefixes
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, ns)| *ns)
            .ok_or_else(|| Error::Predicate(format!("unknown namespace prefix '{}'", prefix)))?;
        Step::new(name, Some(ns))
    } else {
        Step::new(qname, None)
    };
    if step.name.as_deref() == Some("") {
        return Err(Error::Predicate(format!("missing element name in '{}'", raw)));
    }

    while !filters.is_empty() {
        let end = filters
            .find(']')
            .ok_or_else(|| Error::Predicate(format!("unterminated filter in '{}'", raw)))?;
        let filter = filters[1..end].trim();
        let (name, value) = filter
            .strip_prefix('@')
            .and_then(|f| f.split_once('='))
            .ok_or_else(|| Error::Predicate(format!("invalid filter '[{}]'", filter)))?;
        let value = value.trim();
        let unquoted = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
            .ok_or_else(|| Error::Predicate(format!("unquoted value in '[{}]'", filter)))?;
        step.attrs.push((name.trim().to_string(), unquoted.to_string()));
        filters = &filters[end + 1..];
    }
    Ok(step)
}
