//! Registry of pending waits.
//!
//! Every inbound stanza is offered to all registered waiters; each one whose
//! predicate set matches is completed and removed. A waiter is removed as well
//! when its [`PendingWait`] is dropped or times out, so a late stanza can never
//! complete a wait nobody is listening to anymore.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

use crate::predicate::{describe, Predicate};
use crate::stanza::Stanza;
use crate::Error;

type Completion = oneshot::Sender<Result<Stanza, Error>>;

struct Waiter {
    predicates: Vec<Predicate>,
    tx: Completion,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    waiters: BTreeMap<u64, Waiter>,
    /// Set once the stream is gone; new registrations fail with this reason.
    closed: Option<String>,
}

#[derive(Default)]
pub(crate) struct WaiterRegistry {
    inner: Mutex<Inner>,
}

impl WaiterRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        predicates: Vec<Predicate>,
    ) -> Result<PendingWait, Error> {
        if predicates.is_empty() {
            return Err(Error::Predicate("wait requires at least one predicate".into()));
        }
        let description = describe(&predicates);
        let (tx, rx) = oneshot::channel();

        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(Error::closed(reason.clone()));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.waiters.insert(id, Waiter { predicates, tx });
        trace!(id, predicates = %description, "Registered waiter");

        Ok(PendingWait {
            id,
            rx,
            description,
            registry: Arc::clone(self),
        })
    }

    /// Complete every waiter matching `stanza`; returns how many matched.
    pub(crate) fn offer(&self, stanza: &Stanza) -> usize {
        let mut inner = self.lock();
        let matched: Vec<u64> = inner
            .waiters
            .iter()
            .filter(|(_, w)| w.predicates.iter().any(|p| p.matches_stanza(stanza)))
            .map(|(id, _)| *id)
            .collect();

        for id in &matched {
            if let Some(waiter) = inner.waiters.remove(id) {
                // The receiver may have been dropped between match and send.
                let _ = waiter.tx.send(Ok(stanza.clone()));
            }
        }
        matched.len()
    }

    fn remove(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// Fail all outstanding waiters and refuse new ones.
    pub(crate) fn close(&self, reason: &str, make_error: impl Fn() -> Error) {
        let mut inner = self.lock();
        if inner.closed.is_none() {
            inner.closed = Some(reason.to_string());
        }
        for (_, waiter) in std::mem::take(&mut inner.waiters) {
            let _ = waiter.tx.send(Err(make_error()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// A registered waiter. Register before sending the request it waits for so
/// that a fast reply cannot be missed.
pub struct PendingWait {
    id: u64,
    rx: oneshot::Receiver<Result<Stanza, Error>>,
    description: String,
    registry: Arc<WaiterRegistry>,
}

impl PendingWait {
    /// Suspend until a matching stanza arrives, the stream closes, or
    /// `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Stanza, Error> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::closed("stream dropped")),
            Err(_) => Err(Error::Timeout {
                timeout,
                predicates: self.description.clone(),
            }),
        }
    }

    /// The predicates this waiter was registered with.
    pub fn predicates(&self) -> &str {
        &self.description
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
