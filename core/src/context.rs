//! Per-call scoped metadata, threaded explicitly through interceptors and handlers.
//!
//! A [CallContext] is cheap to clone; clones share the same header sets, so a header set by an
//! interceptor is visible to the handler it wraps and vice versa.
//!
//! Header sets follow the call's lifecycle:
//! - outgoing headers (client side) are frozen once the request is published;
//! - incoming headers (server side) are the request's metadata and are read-only;
//! - response headers are written by the server and frozen once the reply is sent, then
//!   become readable by the client after the call resolves.

use crate::header::Headers;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Default)]
struct HeaderSlots {
    outgoing: Mutex<Headers>,
    incoming: Mutex<Headers>,
    response: Mutex<Headers>,
    outgoing_sealed: AtomicBool,
    response_sealed: AtomicBool,
}

#[derive(Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
    slots: Arc<HeaderSlots>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "CallContext(deadline={:?}, cancelled={})", self.deadline, self.is_cancelled())
    }
}

impl CallContext {
    #[inline]
    pub fn new() -> Self {
        Self { deadline: None, cancel: CancellationToken::new(), slots: Arc::default() }
    }

    /// Tighten the deadline to now + `timeout`. An earlier deadline is kept.
    #[inline]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[inline]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = match self.deadline {
            Some(d) if d <= deadline => Some(d),
            _ => Some(deadline),
        };
        self
    }

    /// Bind cancellation to an external token, e.g. a parent task's.
    #[inline]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The instant a wait bounded by `timeout` must give up: the earlier of the context deadline
    /// and now + `timeout`.
    #[inline]
    pub fn effective_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        let by_timeout = timeout.map(|t| Instant::now() + t);
        match (self.deadline, by_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    #[inline]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[inline]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Attach an outgoing header. Returns false once the request has been sent.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let mut guard = self.slots.outgoing.lock().unwrap();
        if self.slots.outgoing_sealed.load(Ordering::Acquire) {
            return false;
        }
        guard.insert(name, value);
        true
    }

    pub fn set_headers(&self, headers: &Headers) -> bool {
        let mut guard = self.slots.outgoing.lock().unwrap();
        if self.slots.outgoing_sealed.load(Ordering::Acquire) {
            return false;
        }
        guard.merge(headers);
        true
    }

    #[inline]
    pub fn outgoing_headers(&self) -> Headers {
        self.slots.outgoing.lock().unwrap().clone()
    }

    /// Freeze the outgoing set and return what goes on the wire.
    pub fn seal_outgoing(&self) -> Headers {
        let guard = self.slots.outgoing.lock().unwrap();
        self.slots.outgoing_sealed.store(true, Ordering::Release);
        guard.clone()
    }

    /// Request metadata as seen by the server.
    #[inline]
    pub fn incoming_headers(&self) -> Headers {
        self.slots.incoming.lock().unwrap().clone()
    }

    #[inline]
    pub fn incoming_header(&self, name: &str) -> Option<String> {
        self.slots.incoming.lock().unwrap().get(name).map(|s| s.to_string())
    }

    #[doc(hidden)]
    pub fn set_incoming(&self, headers: Headers) {
        *self.slots.incoming.lock().unwrap() = headers;
    }

    /// Set a header on the reply. Returns false once the reply has been sent.
    pub fn set_response_header(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let mut guard = self.slots.response.lock().unwrap();
        if self.slots.response_sealed.load(Ordering::Acquire) {
            return false;
        }
        guard.insert(name, value);
        true
    }

    pub fn set_response_headers(&self, headers: &Headers) -> bool {
        let mut guard = self.slots.response.lock().unwrap();
        if self.slots.response_sealed.load(Ordering::Acquire) {
            return false;
        }
        guard.merge(headers);
        true
    }

    /// On the server, what has been set so far. On the client, the reply's metadata.
    #[inline]
    pub fn response_headers(&self) -> Headers {
        self.slots.response.lock().unwrap().clone()
    }

    #[doc(hidden)]
    pub fn seal_response(&self) -> Headers {
        let guard = self.slots.response.lock().unwrap();
        self.slots.response_sealed.store(true, Ordering::Release);
        guard.clone()
    }

    /// Record the reply's metadata on the client side.
    #[doc(hidden)]
    pub fn resolve_response(&self, headers: Headers) {
        *self.slots.response.lock().unwrap() = headers;
        self.slots.response_sealed.store(true, Ordering::Release);
    }
}
