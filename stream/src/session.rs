//! One direction of a stream session.
//!
//! A [StreamSender] owns the outgoing sequence counter of its direction. A [StreamReceiver]
//! owns the ephemeral subscription and releases it exactly once, on the first of: explicit
//! close, terminal frame observed, or unrecoverable error (timeout and cancellation included).
//!
//! Sequence policy: frames with a sequence number at or below the last delivered one are
//! duplicates from at-least-once delivery and are dropped. A frame skipping ahead means a lost
//! frame, the session fails with `rpc_stream_gap`. Frames are never reordered.

use crate::proto::{self, Frame};
use bytes::Bytes;
use micro_rpc_codec::{AnyCodec, Codec};
use micro_rpc_core::header::Headers;
use micro_rpc_core::transport::{Subscription, Transport};
use micro_rpc_core::{CallContext, ErrorEnvelope, RpcError, RpcIntErr};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct StreamSender<T> {
    transport: Arc<dyn Transport>,
    subject: String,
    codec: AnyCodec,
    seq: u64,
    /// Reply subject attached to every frame, the bus reports a vanished peer there
    control: Option<String>,
    cancel: CancellationToken,
    closed: bool,
    _phan: PhantomData<fn(&T)>,
}

impl<T> std::fmt::Debug for StreamSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "sender({} seq={} closed={})", self.subject, self.seq, self.closed)
    }
}

impl<T: Serialize> StreamSender<T> {
    pub fn new(
        transport: Arc<dyn Transport>, subject: String, codec: AnyCodec, control: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self { transport, subject, codec, seq: 0, control, cancel, closed: false, _phan: PhantomData }
    }

    #[inline(always)]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn send(&mut self, msg: &T) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcIntErr::InvalidState.into());
        }
        if self.cancel.is_cancelled() {
            self.closed = true;
            return Err(RpcIntErr::Cancelled.into());
        }
        let payload = match self.codec.encode(msg) {
            Ok(buf) => Bytes::from(buf),
            Err(()) => return Err(RpcIntErr::Encode.into()),
        };
        self.seq += 1;
        let mut frame = proto::data_frame(&self.subject, self.seq, payload, Headers::new());
        frame.reply = self.control.clone();
        self.publish(frame).await
    }

    /// Emit the end marker, carrying `err` if any. Closing twice is a no-op.
    pub async fn close(
        &mut self, err: Option<&ErrorEnvelope>, headers: Headers,
    ) -> Result<(), RpcError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.seq += 1;
        let frame = proto::end_frame(&self.subject, self.seq, err, headers);
        self.publish(frame).await
    }

    #[inline]
    async fn publish(&mut self, frame: micro_rpc_core::Message) -> Result<(), RpcError> {
        if let Err(e) = self.transport.publish(frame).await {
            self.closed = true;
            return Err(RpcError::unavailable(format!("stream publish to {}: {}", self.subject, e)));
        }
        Ok(())
    }
}

pub struct StreamReceiver<T> {
    sub: Option<Subscription>,
    codec: AnyCodec,
    ctx: CallContext,
    idle_timeout: Option<Duration>,
    last_seq: u64,
    terminal: bool,
    last_error: Option<RpcError>,
    _phan: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for StreamReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "receiver({:?} seq={} terminal={})", self.sub, self.last_seq, self.terminal)
    }
}

impl<T: DeserializeOwned> StreamReceiver<T> {
    /// `idle_timeout` bounds each wait, the context deadline bounds them all.
    pub fn new(
        sub: Subscription, codec: AnyCodec, ctx: CallContext, idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            sub: Some(sub),
            codec,
            ctx,
            idle_timeout,
            last_seq: 0,
            terminal: false,
            last_error: None,
            _phan: PhantomData,
        }
    }

    #[inline(always)]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    #[inline(always)]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    #[inline]
    pub fn last_error(&self) -> Option<&RpcError> {
        self.last_error.as_ref()
    }

    /// Next message in sequence order. `Ok(None)` is the normal end of the stream, an error
    /// carried by the end marker comes back as `Err`. Once terminal, keeps returning the same.
    pub async fn recv(&mut self) -> Result<Option<T>, RpcError> {
        loop {
            if self.terminal {
                return match &self.last_error {
                    Some(e) => Err(e.clone()),
                    None => Ok(None),
                };
            }
            let res = match &self.sub {
                Some(sub) => sub.next_until(&self.ctx, self.idle_timeout).await,
                None => Err(RpcIntErr::InvalidState.into()),
            };
            let msg = match res {
                Ok(msg) => msg,
                Err(e) => return Err(self.fail(e)),
            };
            let (seq, end) = match Frame::parse(&msg) {
                Frame::NoResponders => {
                    return Err(self.fail(RpcError::unavailable("stream peer is gone")));
                }
                Frame::Error(e) => return Err(self.fail(e.into())),
                Frame::Handshake { inbox } => {
                    trace!("{:?} ignore stray handshake {}", self, inbox);
                    continue;
                }
                Frame::Malformed(reason) => {
                    warn!("{:?} malformed frame: {}", self, reason);
                    return Err(self.fail(RpcIntErr::Decode.into()));
                }
                Frame::Data { seq, payload } => (seq, Ok(payload)),
                Frame::End { seq, err } => (seq, Err(err)),
            };
            if seq <= self.last_seq {
                debug!("{:?} drop duplicate frame seq={}", self, seq);
                continue;
            }
            if seq != self.last_seq + 1 {
                warn!("{:?} frame seq={} skips ahead", self, seq);
                return Err(self.fail(RpcIntErr::StreamGap.into()));
            }
            self.last_seq = seq;
            match end {
                Ok(payload) => match self.codec.decode::<T>(&payload) {
                    Ok(v) => return Ok(Some(v)),
                    Err(()) => return Err(self.fail(RpcIntErr::Decode.into())),
                },
                Err(None) => {
                    self.resolve_headers(msg.headers);
                    self.terminal = true;
                    self.release();
                    return Ok(None);
                }
                Err(Some(e)) => {
                    self.resolve_headers(msg.headers);
                    return Err(self.fail(e.into()));
                }
            }
        }
    }

    /// Stop receiving and release the subscription.
    pub fn close(&mut self) {
        if !self.terminal {
            self.terminal = true;
        }
        self.release();
    }

    #[inline]
    fn resolve_headers(&self, mut headers: Headers) {
        headers.strip_reserved();
        if !headers.is_empty() {
            self.ctx.resolve_response(headers);
        }
    }

    #[inline]
    fn fail(&mut self, e: RpcError) -> RpcError {
        self.terminal = true;
        self.last_error = Some(e.clone());
        self.release();
        e
    }

    #[inline]
    fn release(&mut self) {
        if let Some(sub) = self.sub.take() {
            trace!("release {:?}", sub);
            sub.unsubscribe();
        }
    }
}
