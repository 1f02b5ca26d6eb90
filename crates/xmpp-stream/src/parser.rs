//! Incremental XML parsing for a client XMPP stream.
//!
//! An XMPP session is one long-lived XML document: the `<stream:stream>`
//! opening tag arrives first and its closing tag only at the very end. The
//! parser scans raw bytes as they arrive, tracking element depth, and hands
//! out each complete depth-1 element as soon as its end tag has been seen.
//! Complete fragments are parsed with minidom inside a synthetic copy of the
//! stream header so that they inherit its namespace declarations.

use minidom::Element;

use crate::stanza::StreamHeader;
use crate::Error;

/// Something the parser recognized in the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    /// The server opened (or reopened) the stream.
    StreamOpened(StreamHeader),
    /// A complete top-level element (stanza, features, nonza).
    Element(Element),
    /// `</stream:stream>` was received.
    StreamClosed,
}

/// Default bound on buffered bytes for one unfinished top-level element.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1024 * 1024;

/// Incremental parser producing [`ParseEvent`]s from arbitrary chunks.
#[derive(Debug)]
pub struct XmlParser {
    buffer: Vec<u8>,
    /// Scan position inside `buffer`.
    pos: usize,
    /// 0 outside the stream, 1 between stanzas, >1 inside a stanza.
    depth: usize,
    /// Start of the top-level element currently being accumulated.
    element_start: Option<usize>,
    /// Raw opening tag of the current stream and its qualified name.
    stream_tag: Option<(String, String)>,
    max_stanza_size: usize,
}

enum Markup {
    Open { end: usize, self_closing: bool },
    Close { end: usize, qname: String },
    Skip { end: usize },
}

impl XmlParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            pos: 0,
            depth: 0,
            element_start: None,
            stream_tag: None,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
        }
    }

    /// Limit how many unconsumed bytes may pile up while an element is still
    /// open. Exceeding it is a parse error.
    pub fn with_max_stanza_size(mut self, max: usize) -> Self {
        self.max_stanza_size = max;
        self
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether a stream header has been seen and not yet closed.
    pub fn is_stream_open(&self) -> bool {
        self.stream_tag.is_some()
    }

    /// Forget all state, including buffered bytes. Used when the stream is
    /// restarted after TLS or SASL.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.depth = 0;
        self.element_start = None;
        self.stream_tag = None;
    }

    /// Bytes received but not yet consumed (for debugging).
    pub fn buffer_str(&self) -> String {
        String::from_utf8_lossy(&self.buffer[self.pos..]).to_string()
    }

    /// Return the next complete event, or `None` if more data is needed.
    pub fn next_event(&mut self) -> Result<Option<ParseEvent>, Error> {
        let event = self.scan();
        self.compact();
        if matches!(event, Ok(None)) && self.buffer.len() > self.max_stanza_size {
            return Err(Error::parse(format!(
                "unfinished element exceeds {} bytes",
                self.max_stanza_size
            )));
        }
        event
    }

    fn scan(&mut self) -> Result<Option<ParseEvent>, Error> {
        loop {
            let lt = match self.buffer[self.pos..].iter().position(|&b| b == b'<') {
                Some(offset) => self.pos + offset,
                None => {
                    self.check_top_level_text(self.pos, self.buffer.len())?;
                    self.pos = self.buffer.len();
                    return Ok(None);
                }
            };
            self.check_top_level_text(self.pos, lt)?;

            let markup = match self.classify(lt)? {
                Some(markup) => markup,
                None => {
                    // Incomplete markup; resume scanning from the '<' later.
                    self.pos = lt;
                    return Ok(None);
                }
            };

            match markup {
                Markup::Skip { end } => {
                    self.pos = end;
                }
                Markup::Open { end, self_closing } => {
                    self.pos = end;
                    match self.depth {
                        0 => return self.open_stream(lt, end).map(Some),
                        1 if self_closing => {
                            return self.complete_element(lt, end).map(Some);
                        }
                        1 => {
                            self.element_start = Some(lt);
                            self.depth = 2;
                        }
                        _ if self_closing => {}
                        _ => self.depth += 1,
                    }
                }
                Markup::Close { end, qname } => {
                    self.pos = end;
                    match self.depth {
                        0 => {
                            return Err(Error::parse(format!(
                                "unexpected closing tag </{}> outside of stream",
                                qname
                            )))
                        }
                        1 => return self.close_stream(&qname).map(Some),
                        _ => {
                            self.depth -= 1;
                            if self.depth == 1 {
                                let start = self.element_start.take().unwrap_or(lt);
                                return self.complete_element(start, end).map(Some);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Only whitespace may appear between top-level elements.
    fn check_top_level_text(&self, from: usize, to: usize) -> Result<(), Error> {
        if self.depth > 1 || from >= to {
            return Ok(());
        }
        if self.buffer[from..to].iter().all(|b| b.is_ascii_whitespace()) {
            Ok(())
        } else {
            Err(Error::parse(format!(
                "unexpected character data at stream level: {}",
                String::from_utf8_lossy(&self.buffer[from..to]).trim()
            )))
        }
    }

    /// Determine what kind of markup starts at `lt`, or `None` if it is not
    /// complete yet.
    fn classify(&self, lt: usize) -> Result<Option<Markup>, Error> {
        let rest = &self.buffer[lt..];
        if rest.len() < 2 {
            return Ok(None);
        }
        match rest[1] {
            b'?' => Ok(find(rest, b"?>").map(|i| Markup::Skip { end: lt + i + 2 })),
            b'!' => {
                const COMMENT: &[u8] = b"<!--";
                const CDATA: &[u8] = b"<![CDATA[";
                if rest.starts_with(COMMENT) {
                    Ok(find(&rest[4..], b"-->").map(|i| Markup::Skip { end: lt + 4 + i + 3 }))
                } else if rest.starts_with(CDATA) {
                    if self.depth < 2 {
                        return Err(Error::parse("CDATA section at stream level"));
                    }
                    Ok(find(&rest[9..], b"]]>").map(|i| Markup::Skip { end: lt + 9 + i + 3 }))
                } else if COMMENT.starts_with(rest) || CDATA.starts_with(rest) {
                    Ok(None)
                } else {
                    Err(Error::parse("document type declarations are not allowed"))
                }
            }
            b'/' => Ok(find_tag_end(rest).map(|i| {
                let qname = String::from_utf8_lossy(&rest[2..i]).trim().to_string();
                Markup::Close { end: lt + i + 1, qname }
            })),
            _ => Ok(find_tag_end(rest).map(|i| Markup::Open {
                end: lt + i + 1,
                self_closing: rest[i - 1] == b'/',
            })),
        }
    }

    fn open_stream(&mut self, start: usize, end: usize) -> Result<ParseEvent, Error> {
        let tag = self.fragment(start, end)?.to_string();
        let qname = tag_name(&tag);
        if qname.rsplit(':').next() != Some("stream") {
            return Err(Error::parse(format!(
                "expected stream header, got <{}>",
                qname
            )));
        }
        if tag.ends_with("/>") {
            return Err(Error::parse("stream header must not be self-closing"));
        }

        let element: Element = format!("{}</{}>", tag, qname)
            .parse()
            .map_err(|e| Error::parse(format!("invalid stream header: {}", e)))?;
        let default_ns = tag_attributes(&tag)
            .into_iter()
            .find(|(name, _)| name == "xmlns")
            .map(|(_, value)| value)
            .unwrap_or_default();
        let header = StreamHeader::from_element(element, &default_ns)?;

        self.stream_tag = Some((tag, qname));
        self.depth = 1;
        Ok(ParseEvent::StreamOpened(header))
    }

    fn close_stream(&mut self, qname: &str) -> Result<ParseEvent, Error> {
        match &self.stream_tag {
            Some((_, stream_qname)) if stream_qname == qname => {
                self.stream_tag = None;
                self.depth = 0;
                Ok(ParseEvent::StreamClosed)
            }
            _ => Err(Error::parse(format!("unexpected closing tag </{}>", qname))),
        }
    }

    fn complete_element(&mut self, start: usize, end: usize) -> Result<ParseEvent, Error> {
        let fragment = self.fragment(start, end)?;
        let (tag, qname) = self
            .stream_tag
            .as_ref()
            .ok_or_else(|| Error::parse("element outside of stream"))?;

        let wrapped: Element = format!("{}{}</{}>", tag, fragment, qname)
            .parse()
            .map_err(|e| Error::parse(format!("Failed to parse element: {}", e)))?;
        wrapped
            .children()
            .next()
            .cloned()
            .map(ParseEvent::Element)
            .ok_or_else(|| Error::parse("empty element"))
    }

    fn fragment(&self, start: usize, end: usize) -> Result<&str, Error> {
        std::str::from_utf8(&self.buffer[start..end])
            .map_err(|e| Error::parse(format!("Invalid UTF-8: {}", e)))
    }

    /// Drop consumed bytes, keeping any partially received element.
    fn compact(&mut self) {
        let keep = self.element_start.unwrap_or(self.pos);
        if keep == 0 {
            return;
        }
        self.buffer.drain(..keep);
        self.pos -= keep;
        if let Some(start) = self.element_start.as_mut() {
            *start -= keep;
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Index of the '>' closing the tag that starts at offset 0, skipping
/// quoted attribute values.
fn find_tag_end(tag: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in tag.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

/// Qualified name of an opening tag.
fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('<')
        .split(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Raw attributes of an opening tag, values left unescaped.
fn tag_attributes(tag: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let name_len = tag_name(tag).len() + 1;
    let mut rest = tag.get(name_len..).unwrap_or_default();

    while let Some(eq) = rest.find('=') {
        let name = rest[..eq].trim().to_string();
        let after = rest[eq + 1..].trim_start();
        let Some(quote) = after.chars().next().filter(|c| *c == '"' || *c == '\'') else {
            break;
        };
        let Some(close) = after[1..].find(quote) else {
            break;
        };
        attrs.push((name, after[1..close + 1].to_string()));
        rest = &after[close + 2..];
    }
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' \
        id='abc123' version='1.0' xml:lang='en'>";

    fn opened() -> XmlParser {
        let mut parser = XmlParser::new();
        parser.feed(HEADER.as_bytes());
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(ParseEvent::StreamOpened(_))
        ));
        parser
    }

    #[test]
    fn test_oversized_unfinished_element_is_rejected() {
        let mut parser = opened().with_max_stanza_size(64);
        parser.feed(b"<message><body>");
        assert!(parser.next_event().unwrap().is_none());

        parser.feed(&[b'x'; 100]);
        assert!(matches!(parser.next_event(), Err(Error::Parse(_))));
    }

    #[test]
    fn test_large_complete_element_within_limit() {
        let mut parser = opened().with_max_stanza_size(256);
        let body = "y".repeat(200);
        parser.feed(format!("<message><body>{}</body></message>", body).as_bytes());
        match parser.next_event().unwrap() {
            Some(ParseEvent::Element(element)) => assert_eq!(element.name(), "message"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_stream_header_parsing() {
        let mut parser = XmlParser::new();
        parser.feed(HEADER.as_bytes());

        match parser.next_event().unwrap() {
            Some(ParseEvent::StreamOpened(header)) => {
                assert_eq!(header.default_ns(), ns::JABBER_CLIENT);
                assert_eq!(header.from_attr(), Some("example.com"));
                assert_eq!(header.stream_id(), Some("abc123"));
                assert_eq!(header.version(), Some("1.0"));
            }
            other => panic!("Expected stream header, got {:?}", other),
        }
        assert!(parser.is_stream_open());
    }

    #[test]
    fn test_stream_header_with_double_quotes() {
        let mut parser = XmlParser::new();
        parser.feed(
            br#"<stream:stream xmlns="jabber:server" xmlns:stream="http://etherx.jabber.org/streams" version="1.0">"#,
        );
        match parser.next_event().unwrap() {
            Some(ParseEvent::StreamOpened(header)) => {
                assert_eq!(header.default_ns(), ns::JABBER_SERVER);
            }
            other => panic!("Expected stream header, got {:?}", other),
        }
    }

    #[test]
    fn test_element_split_across_chunks() {
        let mut parser = opened();
        let xml = "<message to='bob@example.com' type='chat'><body>Hello &amp; bye</body></message>";

        for chunk in xml.as_bytes().chunks(7) {
            parser.feed(chunk);
            if parser.buffer_str().ends_with("</message>") {
                break;
            }
            assert_eq!(parser.next_event().unwrap(), None);
        }

        match parser.next_event().unwrap() {
            Some(ParseEvent::Element(el)) => {
                assert_eq!(el.name(), "message");
                assert_eq!(el.ns(), ns::JABBER_CLIENT);
                assert_eq!(
                    el.get_child("body", ns::JABBER_CLIENT).unwrap().text(),
                    "Hello & bye"
                );
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_elements_in_one_chunk() {
        let mut parser = opened();
        parser.feed(
            b"<presence/>\n<iq type='result' id='1'/><stream:features>\
              <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
        );

        let mut names = Vec::new();
        while let Some(ParseEvent::Element(el)) = parser.next_event().unwrap() {
            names.push((el.name().to_string(), el.ns()));
        }
        assert_eq!(
            names,
            vec![
                ("presence".to_string(), ns::JABBER_CLIENT.to_string()),
                ("iq".to_string(), ns::JABBER_CLIENT.to_string()),
                ("features".to_string(), ns::STREAM.to_string()),
            ]
        );
    }

    #[test]
    fn test_nested_same_name_elements() {
        let mut parser = opened();
        parser.feed(b"<message><x xmlns='urn:example'><message>inner</message></x></message>");
        match parser.next_event().unwrap() {
            Some(ParseEvent::Element(el)) => {
                let x = el.get_child("x", "urn:example").unwrap();
                assert_eq!(x.get_child("message", "urn:example").unwrap().text(), "inner");
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_quoted_gt_in_attribute() {
        let mut parser = opened();
        parser.feed(b"<message id='a>b'><body>x</body></message>");
        match parser.next_event().unwrap() {
            Some(ParseEvent::Element(el)) => assert_eq!(el.attr("id"), Some("a>b")),
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_stream_end() {
        let mut parser = opened();
        parser.feed(b"</stream:stream>");
        assert_eq!(parser.next_event().unwrap(), Some(ParseEvent::StreamClosed));
        assert!(!parser.is_stream_open());
    }

    #[test]
    fn test_text_at_stream_level_is_rejected() {
        let mut parser = opened();
        parser.feed(b"garbage<presence/>");
        assert!(matches!(parser.next_event(), Err(Error::Parse(_))));
    }

    #[test]
    fn test_reset_allows_new_header() {
        let mut parser = opened();
        parser.feed(b"<iq type='get' id='x'>");
        parser.reset();
        assert!(!parser.is_stream_open());

        parser.feed(HEADER.as_bytes());
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(ParseEvent::StreamOpened(_))
        ));
    }

    #[test]
    fn test_tag_attributes() {
        let attrs = tag_attributes("<stream:stream xmlns:stream='s' xmlns=\"jabber:client\" to='a'>");
        assert_eq!(
            attrs,
            vec![
                ("xmlns:stream".to_string(), "s".to_string()),
                ("xmlns".to_string(), "jabber:client".to_string()),
                ("to".to_string(), "a".to_string()),
            ]
        );
    }
}
