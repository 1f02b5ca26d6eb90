//! The stream engine.
//!
//! A [`Stream`] owns the transport. Its write half sits behind an async mutex
//! so that every `send` is one uninterrupted write. Its read half belongs to a
//! reader task that feeds the incremental parser and dispatches each parsed
//! element: first to every registered [`Extension`], in registration order,
//! then to every pending waiter.
//!
//! Callers obtain stanzas with [`Stream::wait`] or [`Stream::send_and_wait`].
//! Both are built on [`Stream::expect`], which registers a waiter up front so
//! that a reply arriving before the caller starts waiting is not lost.

mod callbacks;
mod extension;
mod transport;
mod waiter;

pub use callbacks::{NoCallbacks, StreamCallbacks};
pub use extension::{Extension, Extensions};
pub use transport::{BoxedIo, Io, NoTls, RustlsUpgrader, TlsUpgrader};
pub use waiter::PendingWait;

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use jid::Jid;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use crate::client::Credentials;
use crate::negotiation::StreamManagementSession;
use crate::parser::{ParseEvent, XmlParser};
use crate::predicate::Predicate;
use crate::stanza::{Iq, IqType, Stanza, StanzaError, StanzaKind, StreamError, StreamFeatures, StreamHeader};
use crate::{ns, Error};

use waiter::WaiterRegistry;

/// Timeout applied when a caller does not pass one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 8192;

/// Construction options for a [`Stream`].
pub struct StreamOptions {
    pub extensions: Extensions,
    pub callbacks: Arc<dyn StreamCallbacks>,
    pub default_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            extensions: Extensions::new(),
            callbacks: Arc::new(NoCallbacks),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

enum ReaderCommand {
    /// Discard parser state before a stream restart.
    Reset(oneshot::Sender<()>),
    /// Stop reading and hand the read half back (STARTTLS).
    Release(oneshot::Sender<ReadHalf<BoxedIo>>),
}

struct ReaderHandle {
    commands: mpsc::Sender<ReaderCommand>,
    task: JoinHandle<()>,
}

struct Shared {
    credentials: RwLock<Credentials>,
    writer: AsyncMutex<Option<WriteHalf<BoxedIo>>>,
    reader: Mutex<Option<ReaderHandle>>,
    waiters: Arc<WaiterRegistry>,
    extensions: Extensions,
    callbacks: Arc<dyn StreamCallbacks>,
    default_timeout: Duration,
    connected: AtomicBool,
    tls_active: AtomicBool,
    last_error: Mutex<Option<StreamError>>,
    header: Mutex<Option<StreamHeader>>,
    features: Mutex<Option<StreamFeatures>>,
    stream_management: Mutex<Option<StreamManagementSession>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A client XMPP stream. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("jid", &self.jid().to_string())
            .field("connected", &self.connected())
            .field("tls_active", &self.tls_active())
            .field("extensions", &self.shared.extensions.names())
            .finish()
    }
}

impl Stream {
    /// Take ownership of a connected transport and start reading from it.
    ///
    /// Must be called from within a tokio runtime. Nothing is sent; use
    /// [`Stream::open`] or the negotiator to start the XML stream.
    pub fn new<T: Io>(io: T, credentials: Credentials, options: StreamOptions) -> Self {
        let io: BoxedIo = Box::new(io);
        let (read, write) = tokio::io::split(io);

        let stream = Self {
            shared: Arc::new(Shared {
                credentials: RwLock::new(credentials),
                writer: AsyncMutex::new(Some(write)),
                reader: Mutex::new(None),
                waiters: Arc::new(WaiterRegistry::new()),
                extensions: options.extensions,
                callbacks: options.callbacks,
                default_timeout: options.default_timeout,
                connected: AtomicBool::new(true),
                tls_active: AtomicBool::new(false),
                last_error: Mutex::new(None),
                header: Mutex::new(None),
                features: Mutex::new(None),
                stream_management: Mutex::new(None),
            }),
        };
        stream.spawn_reader(read);
        stream
    }

    fn spawn_reader(&self, read: ReadHalf<BoxedIo>) {
        let (commands, rx) = mpsc::channel(4);
        let task = tokio::spawn(read_loop(Arc::downgrade(&self.shared), read, rx));
        if let Some(previous) = lock(&self.shared.reader).replace(ReaderHandle { commands, task }) {
            previous.task.abort();
        }
    }

    /// The account JID; after resource binding, the full JID assigned by the
    /// server.
    pub fn jid(&self) -> Jid {
        self.credentials().jid
    }

    pub(crate) fn credentials(&self) -> Credentials {
        self.shared
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_jid(&self, jid: Jid) {
        self.shared
            .credentials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .jid = jid;
    }

    /// Whether the transport is still attached.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn tls_active(&self) -> bool {
        self.shared.tls_active.load(Ordering::SeqCst)
    }

    /// The last `<stream:error/>` received, if any.
    pub fn last_error(&self) -> Option<StreamError> {
        lock(&self.shared.last_error).clone()
    }

    pub fn default_timeout(&self) -> Duration {
        self.shared.default_timeout
    }

    /// The most recent stream header received from the server.
    pub fn stream_header(&self) -> Option<StreamHeader> {
        lock(&self.shared.header).clone()
    }

    /// The features advertised after the most recent stream (re)start.
    pub fn features(&self) -> Option<StreamFeatures> {
        lock(&self.shared.features).clone()
    }

    /// The stream management session, when it was enabled.
    pub fn stream_management(&self) -> Option<StreamManagementSession> {
        lock(&self.shared.stream_management).clone()
    }

    pub(crate) fn set_stream_management(&self, session: StreamManagementSession) {
        *lock(&self.shared.stream_management) = Some(session);
    }

    pub fn extensions(&self) -> &Extensions {
        &self.shared.extensions
    }

    /// The registered extension of type `T`.
    pub fn extension<T: Extension>(&self) -> Option<Arc<T>> {
        self.shared.extensions.get::<T>()
    }

    /// Number of registered waiters (diagnostics).
    pub fn pending_waits(&self) -> usize {
        self.shared.waiters.len()
    }

    /// Write raw text to the transport as a single write. Logs and succeeds
    /// without writing when the transport is gone.
    pub async fn send_raw(&self, data: &str) -> Result<(), Error> {
        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            warn!("Not connected; dropping outbound data");
            return Ok(());
        };
        trace!(data, "SEND");
        writer.write_all(data.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Serialize and write `stanza`, then run every extension's send hook.
    pub async fn send(&self, stanza: &Stanza) -> Result<(), Error> {
        let xml = stanza.to_xml()?;
        debug!(name = stanza.name(), id = ?stanza.id(), "Sending stanza");
        self.send_raw(&xml).await?;

        for extension in self.shared.extensions.iter() {
            match std::panic::catch_unwind(AssertUnwindSafe(|| extension.on_send(self, stanza))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(extension = extension.name(), error = %e, "Extension send hook failed")
                }
                Err(_) => error!(extension = extension.name(), "Extension send hook panicked"),
            }
        }
        Ok(())
    }

    /// Register a waiter for the next stanza matching any of `predicates`.
    pub fn expect(&self, predicates: Vec<Predicate>) -> Result<PendingWait, Error> {
        self.shared.waiters.register(predicates)
    }

    /// Wait for the next stanza matching any of `predicates`.
    pub async fn wait(
        &self,
        predicates: Vec<Predicate>,
        timeout: Option<Duration>,
    ) -> Result<Stanza, Error> {
        self.expect(predicates)?
            .wait(timeout.unwrap_or(self.shared.default_timeout))
            .await
    }

    /// Send `stanza` and wait for the reply with the same element name and id.
    ///
    /// An id is generated when the stanza has none. With `raise_on_error`, a
    /// reply of type `error` is returned as [`Error::Stanza`].
    #[instrument(skip(self, stanza), fields(name = stanza.name()), name = "xmpp.stream.send_and_wait")]
    pub async fn send_and_wait(
        &self,
        mut stanza: Stanza,
        raise_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<Stanza, Error> {
        let id = match stanza.id() {
            Some(id) => id.to_string(),
            None => stanza.generate_id(None)?,
        };

        let pending = self.expect(vec![Predicate::element(stanza.name(), None).attr("id", &id)])?;
        self.send(&stanza).await?;
        let reply = pending
            .wait(timeout.unwrap_or(self.shared.default_timeout))
            .await?;

        if raise_on_error && reply.type_attr() == Some("error") {
            let error = reply.error().unwrap_or_else(|| {
                StanzaError::new(
                    crate::stanza::StanzaErrorType::Cancel,
                    crate::stanza::StanzaErrorCondition::UndefinedCondition,
                )
            });
            return Err(Error::Stanza(error));
        }
        Ok(reply)
    }

    /// IQ round trip with a single empty `<child_name xmlns=namespace/>`
    /// payload.
    pub async fn send_and_wait_iq(
        &self,
        namespace: &str,
        to: Option<&Jid>,
        child_name: &str,
        iq_type: IqType,
        raise_on_error: bool,
        timeout: Option<Duration>,
    ) -> Result<Iq, Error> {
        let mut iq = Iq::request(iq_type, child_name, namespace);
        iq.set_to_jid(to);
        let reply = self
            .send_and_wait(iq.into_stanza(), raise_on_error, timeout)
            .await?;
        Iq::try_from(reply)
    }

    /// Send our stream header and wait for the server's header and features.
    pub async fn open(&self, timeout: Duration) -> Result<StreamFeatures, Error> {
        let domain = self.jid().domain().to_string();

        let header_wait = self.expect(vec![Predicate::element("stream", Some(ns::STREAM))])?;
        let features_wait = self.expect(vec![Predicate::element("features", Some(ns::STREAM))])?;
        self.send_raw(&StreamHeader::client(&domain).to_xml()).await?;

        let header = StreamHeader::from_element(
            header_wait.wait(timeout).await?.into_element(),
            ns::JABBER_CLIENT,
        )?;
        header.validate()?;
        debug!(id = ?header.stream_id(), "Stream opened");

        let features = StreamFeatures::try_from(features_wait.wait(timeout).await?)?;
        *lock(&self.shared.features) = Some(features.clone());
        Ok(features)
    }

    /// Restart the XML stream on the same transport: discard parser state,
    /// then [`Stream::open`] again.
    pub async fn restart(&self, timeout: Duration) -> Result<StreamFeatures, Error> {
        let commands = lock(&self.shared.reader)
            .as_ref()
            .map(|reader| reader.commands.clone())
            .ok_or_else(|| Error::closed("stream reader is not running"))?;

        let (ack, acked) = oneshot::channel();
        commands
            .send(ReaderCommand::Reset(ack))
            .await
            .map_err(|_| Error::closed("stream reader stopped"))?;
        acked
            .await
            .map_err(|_| Error::closed("stream reader stopped"))?;

        self.open(timeout).await
    }

    /// Upgrade the transport in place. The caller must already have received
    /// the server's `<proceed/>`.
    #[instrument(skip(self, upgrader), name = "xmpp.stream.starttls")]
    pub async fn starttls(&self, upgrader: &dyn TlsUpgrader, domain: &str) -> Result<(), Error> {
        let reader = lock(&self.shared.reader)
            .take()
            .ok_or_else(|| Error::closed("stream reader is not running"))?;

        let (tx, rx) = oneshot::channel();
        reader
            .commands
            .send(ReaderCommand::Release(tx))
            .await
            .map_err(|_| Error::closed("stream reader stopped"))?;
        let read = rx
            .await
            .map_err(|_| Error::closed("stream reader stopped"))?;

        let write = self
            .shared
            .writer
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::closed("transport closed"))?;

        let io = read.unsplit(write);
        let io = upgrader.upgrade(io, domain).await?;
        let (read, write) = tokio::io::split(io);

        *self.shared.writer.lock().await = Some(write);
        self.shared.tls_active.store(true, Ordering::SeqCst);
        self.spawn_reader(read);
        Ok(())
    }

    /// Run every extension's post-session hook, in registration order.
    /// Failures are logged; they do not undo the session.
    pub(crate) async fn run_post_session(&self) {
        for extension in self.shared.extensions.iter() {
            match AssertUnwindSafe(extension.post_session(self))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => debug!(extension = extension.name(), "Post-session hook done"),
                Ok(Err(e)) => {
                    warn!(extension = extension.name(), error = %e, "Post-session hook failed")
                }
                Err(_) => error!(extension = extension.name(), "Post-session hook panicked"),
            }
        }
    }

    /// Close the XML stream and the transport. Outstanding waiters fail with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        if self.connected() {
            if let Err(e) = self.send_raw("</stream:stream>").await {
                debug!(error = %e, "Failed to send stream close");
            }
        }
        self.teardown("stream closed", || Error::closed("stream closed"))
            .await;

        let reader = lock(&self.shared.reader).take();
        if let Some(reader) = reader {
            reader.task.abort();
        }
    }

    async fn teardown(&self, reason: &str, make_error: impl Fn() -> Error) {
        let was_connected = self.shared.connected.swap(false, Ordering::SeqCst);
        self.shared.waiters.close(reason, make_error);

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Transport shutdown failed");
            }
        }

        if was_connected {
            debug!(reason, "Stream disconnected");
            self.shared.callbacks.disconnected(reason);
        }
    }

    async fn handle_event(&self, event: ParseEvent) -> ControlFlow<()> {
        match event {
            ParseEvent::StreamOpened(header) => {
                *lock(&self.shared.header) = Some(header.clone());
                self.dispatch(header.into_stanza()).await;
                ControlFlow::Continue(())
            }
            ParseEvent::Element(element) => {
                let stanza = Stanza::from_element(element);
                if stanza.kind() != StanzaKind::StreamError {
                    self.dispatch(stanza).await;
                    return ControlFlow::Continue(());
                }
                match StreamError::try_from(stanza) {
                    Ok(stream_error) => self.on_stream_error(stream_error).await,
                    Err(e) => {
                        self.teardown("invalid stream error", || Error::malformed(e.to_string()))
                            .await
                    }
                }
                ControlFlow::Break(())
            }
            ParseEvent::StreamClosed => {
                self.teardown("stream closed by peer", || {
                    Error::closed("stream closed by peer")
                })
                .await;
                ControlFlow::Break(())
            }
        }
    }

    async fn on_stream_error(&self, stream_error: StreamError) {
        let condition = stream_error.condition();
        let text = stream_error.text();
        warn!(condition = %condition, text = ?text, "Received stream error");

        self.shared.callbacks.stream_error(&stream_error);
        *lock(&self.shared.last_error) = Some(stream_error);

        let reason = format!("stream error: {}", condition);
        self.teardown(&reason, || Error::Stream {
            condition: condition.clone(),
            text: text.clone(),
        })
        .await;
    }

    async fn dispatch(&self, stanza: Stanza) {
        debug!(name = stanza.name(), id = ?stanza.id(), "Dispatching stanza");

        for extension in self.shared.extensions.iter() {
            match AssertUnwindSafe(extension.on_stanza(self, &stanza))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(extension = extension.name(), error = %e, "Extension failed handling stanza")
                }
                Err(_) => error!(extension = extension.name(), "Extension panicked handling stanza"),
            }
        }

        let matched = self.shared.waiters.offer(&stanza);
        trace!(matched, "Offered stanza to waiters");
    }
}

async fn read_loop(
    shared: Weak<Shared>,
    mut reader: ReadHalf<BoxedIo>,
    mut commands: mpsc::Receiver<ReaderCommand>,
) {
    let mut parser = XmlParser::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(ReaderCommand::Reset(ack)) => {
                    parser.reset();
                    let _ = ack.send(());
                }
                Some(ReaderCommand::Release(tx)) => {
                    let _ = tx.send(reader);
                    return;
                }
                None => return,
            },

            read = reader.read(&mut buf) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let stream = Stream { shared };

                match read {
                    Ok(0) => {
                        stream
                            .teardown("connection closed by peer", || {
                                Error::closed("connection closed by peer")
                            })
                            .await;
                        return;
                    }
                    Ok(n) => {
                        trace!(data = %String::from_utf8_lossy(&buf[..n]), "RECV");
                        parser.feed(&buf[..n]);
                        loop {
                            match parser.next_event() {
                                Ok(Some(event)) => {
                                    if stream.handle_event(event).await.is_break() {
                                        return;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    error!(error = %e, "Closing stream on malformed XML");
                                    let message = e.to_string();
                                    stream
                                        .teardown("malformed XML", || Error::parse(message.clone()))
                                        .await;
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Transport read failed");
                        let message = e.to_string();
                        stream
                            .teardown("transport error", || Error::closed(message.clone()))
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>";

    fn credentials() -> Credentials {
        Credentials::new("alice@example.com/phone".parse().unwrap(), "secret")
    }

    async fn connected(options: StreamOptions) -> (Stream, DuplexStream) {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let stream = Stream::new(client, credentials(), options);
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        (stream, server)
    }

    async fn read_some(server: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn test_disjoint_waiters() {
        let (stream, mut server) = connected(StreamOptions::default()).await;

        let first = stream.expect(vec![Predicate::element("message", None)]).unwrap();
        let second = stream.expect(vec![Predicate::element("presence", None)]).unwrap();
        server
            .write_all(b"<message from='bob@example.com'><body>hi</body></message>")
            .await
            .unwrap();

        let message = first.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(message.name(), "message");
        assert_eq!(stream.pending_waits(), 1);
        drop(second);
        assert_eq!(stream.pending_waits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_is_deregistered() {
        let (stream, mut server) = connected(StreamOptions::default()).await;

        let result = stream
            .wait(vec![Predicate::element("iq", None)], Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(stream.pending_waits(), 0);

        // A later match has nobody to resolve; the stream stays usable.
        server.write_all(b"<iq type='get' id='late'/>").await.unwrap();
        let next = stream.expect(vec![Predicate::element("presence", None)]).unwrap();
        server.write_all(b"<presence/>").await.unwrap();
        assert!(next.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_and_wait_assigns_id_and_correlates() {
        let (stream, mut server) = connected(StreamOptions::default()).await;

        let request = Stanza::with_attrs("iq", ns::JABBER_CLIENT, [("type", "get")]);
        assert!(request.id().is_none());

        let handle = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.send_and_wait(request, true, None).await })
        };

        let sent = read_some(&mut server).await;
        let sent: minidom::Element = sent.parse().unwrap();
        let id = sent.attr("id").unwrap().to_string();
        assert!(!id.is_empty());

        // Same id on a different element and a different id on an iq are ignored.
        let replies = format!(
            "<message id='{id}'/><iq type='result' id='other'/><iq type='result' id='{id}'/>"
        );
        server.write_all(replies.as_bytes()).await.unwrap();

        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply.name(), "iq");
        assert_eq!(reply.id(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_send_and_wait_raises_stanza_error() {
        let (stream, mut server) = connected(StreamOptions::default()).await;

        let mut request = Stanza::with_attrs("iq", ns::JABBER_CLIENT, [("type", "get")]);
        request.set_id(Some("q1"));
        let handle = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.send_and_wait(request, true, None).await })
        };

        assert!(read_some(&mut server).await.contains("q1"));
        server
            .write_all(
                b"<iq type='error' id='q1'><error type='cancel'>\
                  <item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            )
            .await
            .unwrap();

        match handle.await.unwrap() {
            Err(Error::Stanza(error)) => {
                assert_eq!(error.condition, crate::stanza::StanzaErrorCondition::ItemNotFound)
            }
            other => panic!("Expected stanza error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stream_error_fails_waiters() {
        let (stream, mut server) = connected(StreamOptions::default()).await;

        let pending = stream.expect(vec![Predicate::element("iq", None)]).unwrap();
        server
            .write_all(
                b"<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
            )
            .await
            .unwrap();

        match pending.wait(Duration::from_secs(5)).await {
            Err(Error::Stream { condition, .. }) => assert_eq!(condition, "conflict"),
            other => panic!("Expected stream error, got {:?}", other),
        }
        assert!(!stream.connected());
        assert_eq!(stream.last_error().unwrap().condition(), "conflict");
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_sends_close_tag() {
        let (stream, mut server) = connected(StreamOptions::default()).await;
        let pending = stream.expect(vec![Predicate::any()]).unwrap();

        stream.close().await;

        assert!(matches!(
            pending.wait(Duration::from_secs(5)).await,
            Err(Error::Closed(_))
        ));
        assert!(read_some(&mut server).await.contains("</stream:stream>"));
        // Sending without a transport is not an error.
        assert!(stream.send(&Stanza::new("presence", ns::JABBER_CLIENT)).await.is_ok());
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Extension for Failing {
        async fn on_stanza(&self, _stream: &Stream, _stanza: &Stanza) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    #[async_trait::async_trait]
    impl Extension for Panicking {
        async fn on_stanza(&self, _stream: &Stream, _stanza: &Stanza) -> anyhow::Result<()> {
            panic!("hook panicked")
        }
    }

    #[derive(Default)]
    struct Counting {
        inbound: AtomicUsize,
        outbound: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Extension for Counting {
        async fn on_stanza(&self, _stream: &Stream, _stanza: &Stanza) -> anyhow::Result<()> {
            self.inbound.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_send(&self, _stream: &Stream, _stanza: &Stanza) -> anyhow::Result<()> {
            self.outbound.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_extensions_do_not_block_delivery() {
        let extensions = Extensions::new()
            .with(Failing)
            .and_then(|e| e.with(Panicking))
            .and_then(|e| e.with(Counting::default()))
            .unwrap();
        let options = StreamOptions {
            extensions,
            ..Default::default()
        };
        let (stream, mut server) = connected(options).await;

        let pending = stream.expect(vec![Predicate::element("message", None)]).unwrap();
        server.write_all(b"<message><body>x</body></message>").await.unwrap();
        assert!(pending.wait(Duration::from_secs(5)).await.is_ok());

        stream
            .send(&Stanza::new("presence", ns::JABBER_CLIENT))
            .await
            .unwrap();

        let counting = stream.extension::<Counting>().unwrap();
        // The server header and the message.
        assert_eq!(counting.inbound.load(Ordering::SeqCst), 2);
        assert_eq!(counting.outbound.load(Ordering::SeqCst), 1);
        assert!(stream.connected());
    }

    #[tokio::test]
    async fn test_malformed_xml_tears_down() {
        let (stream, mut server) = connected(StreamOptions::default()).await;
        let pending = stream.expect(vec![Predicate::any()]).unwrap();
        // Consumes the header event first.
        let _ = pending.wait(Duration::from_secs(5)).await;

        let pending = stream.expect(vec![Predicate::element("iq", None)]).unwrap();
        server.write_all(b"text at stream level<iq/>").await.unwrap();
        assert!(matches!(
            pending.wait(Duration::from_secs(5)).await,
            Err(Error::Parse(_))
        ));
        assert!(!stream.connected());
    }
}
