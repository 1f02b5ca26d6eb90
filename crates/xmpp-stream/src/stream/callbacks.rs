//! Connection state notifications for host applications.

use jid::Jid;

use crate::error::ConnectError;
use crate::resolver::Endpoint;
use crate::stanza::StreamError;

/// Observer of connection state changes. All methods default to no-ops.
///
/// Callbacks run inline on the task that caused the transition and should
/// return quickly.
pub trait StreamCallbacks: Send + Sync {
    fn connecting(&self, _endpoint: &Endpoint) {}

    /// TCP connection established, negotiation about to start.
    fn connected(&self, _endpoint: &Endpoint) {}

    fn connection_failed(&self, _error: &ConnectError) {}

    /// Negotiation finished; `jid` is the bound full JID.
    fn session_started(&self, _jid: &Jid) {}

    fn stream_error(&self, _error: &StreamError) {}

    fn disconnected(&self, _reason: &str) {}
}

/// Callbacks that ignore every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCallbacks;

impl StreamCallbacks for NoCallbacks {}
