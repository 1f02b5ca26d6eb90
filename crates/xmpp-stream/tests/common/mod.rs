//! Scripted in-memory server for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jid::Jid;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use xmpp_stream::client::{ConnectOptions, Credentials};
use xmpp_stream::resolver::Endpoint;
use xmpp_stream::stanza::StreamError;
use xmpp_stream::stream::NoTls;
use xmpp_stream::{ConnectError, StreamCallbacks, TlsPolicy};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const SERVER_HEADER: &str = "<?xml version='1.0'?>\
    <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
    id='c2s-1' from='example.com' version='1.0'>";

pub const STARTTLS: &str = "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
pub const STARTTLS_REQUIRED: &str =
    "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>";
pub const PLAIN: &str = "<mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
    <mechanism>PLAIN</mechanism></mechanisms>";
pub const BIND: &str = "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>";
pub const SESSION: &str = "<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>";
pub const SM: &str = "<sm xmlns='urn:xmpp:sm:3'/>";

pub fn features(inner: &[&str]) -> String {
    format!("<stream:features>{}</stream:features>", inner.concat())
}

/// Value of attribute `name` in the first tag of `xml`, either quote style.
pub fn attr(xml: &str, name: &str) -> Option<String> {
    let tag_end = xml.find('>').unwrap_or(xml.len());
    let tag = &xml[..tag_end];
    for quote in ['"', '\''] {
        let needle = format!(" {}={}", name, quote);
        if let Some(start) = tag.find(&needle) {
            let rest = &tag[start + needle.len()..];
            let end = rest.find(quote)?;
            return Some(rest[..end].to_string());
        }
    }
    None
}

pub struct MockServer {
    io: DuplexStream,
    buffer: String,
}

impl MockServer {
    /// Client end of the transport plus the server.
    pub fn pair() -> (DuplexStream, MockServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (
            client,
            MockServer {
                io: server,
                buffer: String::new(),
            },
        )
    }

    pub async fn send(&mut self, xml: &str) {
        self.io.write_all(xml.as_bytes()).await.unwrap();
    }

    async fn fill(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        let n = tokio::time::timeout(READ_TIMEOUT, self.io.read(&mut buf))
            .await
            .expect("timed out waiting for client data")
            .unwrap();
        self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        n > 0
    }

    /// Read the client's stream header.
    pub async fn read_header(&mut self) -> String {
        loop {
            if let Some(start) = self.buffer.find("<stream:stream") {
                if let Some(len) = self.buffer[start..].find('>') {
                    let header = self.buffer[start..start + len + 1].to_string();
                    self.buffer.drain(..start + len + 1);
                    return header;
                }
            }
            assert!(self.fill().await, "client hung up before stream header");
        }
    }

    /// Read the next complete `<name>` element the client sent.
    pub async fn read_element(&mut self, name: &str) -> String {
        loop {
            if let Some(end) = self.element_end(name) {
                let start = self.element_start(name).unwrap_or(0);
                let element = self.buffer[start..end].to_string();
                self.buffer.drain(..end);
                return element;
            }
            assert!(
                self.fill().await,
                "client hung up before <{}>; received: {}",
                name,
                self.buffer
            );
        }
    }

    fn element_start(&self, name: &str) -> Option<usize> {
        [format!("<{} ", name), format!("<{}>", name), format!("<{}/", name)]
            .iter()
            .filter_map(|open| self.buffer.find(open.as_str()))
            .min()
    }

    fn element_end(&self, name: &str) -> Option<usize> {
        let start = self.element_start(name)?;
        let tag_end = start + self.buffer[start..].find('>')?;
        if self.buffer[..tag_end].ends_with('/') {
            return Some(tag_end + 1);
        }
        let close = format!("</{}>", name);
        self.buffer[start..]
            .find(&close)
            .map(|pos| start + pos + close.len())
    }

    /// Everything the client sends until it shuts the transport down.
    pub async fn read_to_end(&mut self) -> String {
        while self.fill().await {}
        std::mem::take(&mut self.buffer)
    }

    /// Answer the client's stream header with ours and `features`.
    pub async fn accept_stream(&mut self, features: &str) {
        self.read_header().await;
        self.send(SERVER_HEADER).await;
        self.send(features).await;
    }

    /// Run a plain-text login (no TLS, PLAIN, bind) and bind `jid`.
    pub async fn establish(&mut self, jid: &str) {
        self.accept_stream(&features(&[PLAIN])).await;
        self.read_element("auth").await;
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        self.accept_stream(&features(&[BIND])).await;
        let bind = self.read_element("iq").await;
        self.reply_iq(
            &bind,
            &format!(
                "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{}</jid></bind>",
                jid
            ),
        )
        .await;
    }

    /// Reply to an IQ with a result carrying `payload`.
    pub async fn reply_iq(&mut self, request: &str, payload: &str) {
        let id = attr(request, "id").expect("iq without id");
        self.send(&format!("<iq type='result' id='{}'>{}</iq>", id, payload))
            .await;
    }
}

pub fn options(jid: &str) -> ConnectOptions {
    ConnectOptions::new(Credentials::parse(jid, "secret").unwrap())
        .upgrader(Arc::new(NoTls))
        .tls(TlsPolicy::On)
        .timeout(READ_TIMEOUT)
}

/// Records every callback as a short string.
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<String>>,
}

impl RecordingCallbacks {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl StreamCallbacks for RecordingCallbacks {
    fn connecting(&self, endpoint: &Endpoint) {
        self.push(format!("connecting:{}", endpoint));
    }

    fn connected(&self, endpoint: &Endpoint) {
        self.push(format!("connected:{}", endpoint));
    }

    fn connection_failed(&self, error: &ConnectError) {
        self.push(format!("connection_failed:{}", error.exit_code()));
    }

    fn session_started(&self, jid: &Jid) {
        self.push(format!("session_started:{}", jid));
    }

    fn stream_error(&self, error: &StreamError) {
        self.push(format!("stream_error:{}", error.condition()));
    }

    fn disconnected(&self, reason: &str) {
        self.push(format!("disconnected:{}", reason));
    }
}
