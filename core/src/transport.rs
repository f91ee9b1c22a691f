//! The message bus seen by the runtime.
//!
//! A [Transport] offers subject addressing, queue groups and ephemeral inboxes. Deliveries for a
//! subscription are pushed into a crossfire channel owned by the [Subscription]; dropping the
//! subscription unregisters it from the bus exactly once.

use crate::context::CallContext;
use crate::error::{RpcError, RpcIntErr};
use crate::header::{Headers, STATUS};
use bytes::Bytes;
use crossfire::MAsyncRx;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default, PartialEq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "msg(subject={} reply={:?} headers={} payload={})",
            self.subject,
            self.reply,
            self.headers.len(),
            self.payload.len()
        )
    }
}

impl Message {
    #[inline]
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { subject: subject.into(), reply: None, headers: Headers::default(), payload: payload.into() }
    }

    #[inline]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    #[inline]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[inline]
    pub fn status(&self) -> Option<&str> {
        self.headers.get(STATUS)
    }
}

/// Implemented by the bus side that owns a subscription table.
pub trait Unsubscribe: Send + Sync + 'static {
    fn unsubscribe(&self, sid: u64);
}

pub struct Subscription {
    sid: u64,
    subject: String,
    rx: MAsyncRx<Message>,
    owner: Option<Arc<dyn Unsubscribe>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sub({} {})", self.sid, self.subject)
    }
}

impl Subscription {
    #[inline]
    pub fn new(sid: u64, subject: String, rx: MAsyncRx<Message>, owner: Arc<dyn Unsubscribe>) -> Self {
        Self { sid, subject, rx, owner: Some(owner) }
    }

    #[inline(always)]
    pub fn sid(&self) -> u64 {
        self.sid
    }

    #[inline(always)]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// None once the bus has dropped this subscription.
    #[inline]
    pub async fn next(&self) -> Option<Message> {
        self.rx.recv().await.ok()
    }

    #[inline]
    pub fn try_next(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next delivery, bounded by the context (deadline, cancellation) and `timeout`.
    pub async fn next_until(
        &self, ctx: &CallContext, timeout: Option<Duration>,
    ) -> Result<Message, RpcError> {
        let deadline = ctx.effective_deadline(timeout);
        let expire = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            msg = self.next() => match msg {
                Some(msg) => Ok(msg),
                None => Err(RpcError::unavailable(format!("subscription on {} closed", self.subject))),
            },
            _ = expire => Err(RpcIntErr::Timeout.into()),
            _ = ctx.cancelled() => Err(RpcIntErr::Cancelled.into()),
        }
    }

    #[inline]
    pub fn unsubscribe(mut self) {
        self.release();
    }

    #[inline]
    fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.unsubscribe(self.sid);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// A publish/subscribe message bus.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire and forget. Delivery is at-least-once and unordered across publishers.
    async fn publish(&self, msg: Message) -> Result<(), RpcIntErr>;

    /// With a queue group, each message goes to only one member of the group.
    async fn subscribe(
        &self, subject: &str, queue_group: Option<&str>,
    ) -> Result<Subscription, RpcIntErr>;

    /// A fresh unique subject for receiving replies.
    fn new_inbox(&self) -> String;
}

/// Publish `msg` with a fresh reply inbox and wait for the first reply.
///
/// Transport failures map to `UNAVAILABLE`, expiry to `rpc_timeout`. The inbox is unsubscribed
/// on every exit path.
pub async fn request(
    transport: &dyn Transport, mut msg: Message, ctx: &CallContext, timeout: Option<Duration>,
) -> Result<Message, RpcError> {
    let inbox = transport.new_inbox();
    let sub = match transport.subscribe(&inbox, None).await {
        Ok(sub) => sub,
        Err(e) => return Err(RpcError::unavailable(format!("subscribe {}: {}", inbox, e))),
    };
    msg.reply = Some(inbox);
    if let Err(e) = transport.publish(msg).await {
        return Err(RpcError::unavailable(format!("publish: {}", e)));
    }
    sub.next_until(ctx, timeout).await
}
