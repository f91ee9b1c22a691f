//! Handler side of the three streaming shapes.
//!
//! The dispatcher accepts the opening message with one of the `accept_*` functions, hands the
//! resulting stream to the user handler, then finishes it with the handler's result. Stream
//! handles are cheap clones of shared state, so the dispatcher can still finish a stream the
//! handler has moved into a spawned task; sends after the finish fail.

use crate::proto;
use crate::session::{StreamReceiver, StreamSender};
use bytes::Bytes;
use micro_rpc_codec::AnyCodec;
use micro_rpc_core::header::{Headers, NO_RESPONDERS_STATUS};
use micro_rpc_core::transport::{Message, Subscription, Transport};
use micro_rpc_core::{CallContext, ErrorEnvelope, RpcError, RpcIntErr};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Cancel `peer_gone` once the bus reports nobody listens to our frames any more.
fn watch_peer(sub: Subscription, peer_gone: CancellationToken, stop: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = peer_gone.cancelled() => break,
                msg = sub.next() => match msg {
                    Some(msg) => {
                        if msg.status() == Some(NO_RESPONDERS_STATUS) {
                            debug!("{:?}: stream peer is gone, cancel the handler", sub);
                            peer_gone.cancel();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
}

#[inline]
fn reply_inbox(msg: &Message) -> Result<String, RpcError> {
    match proto::reply_to(msg) {
        Some(s) => Ok(s.to_string()),
        None => {
            warn!("stream open on {} without a reply inbox", msg.subject);
            Err(RpcIntErr::InvalidState.into())
        }
    }
}

async fn subscribe_inbox(transport: &Arc<dyn Transport>) -> Result<Subscription, RpcError> {
    let inbox = transport.new_inbox();
    match transport.subscribe(&inbox, None).await {
        Ok(sub) => Ok(sub),
        Err(e) => Err(RpcError::unavailable(format!("subscribe {}: {}", inbox, e))),
    }
}

struct SendShared<T> {
    sender: Mutex<StreamSender<T>>,
    _watch: DropGuard,
}

/// Sends towards the caller. Cancelling the call context (the caller vanished, or the service
/// is stopping) makes further sends fail with `rpc_cancelled`.
pub struct ServerSendStream<T> {
    inner: Arc<SendShared<T>>,
}

impl<T> Clone for ServerSendStream<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Serialize> ServerSendStream<T> {
    async fn new(
        transport: &Arc<dyn Transport>, reply: String, codec: AnyCodec, ctx: &CallContext,
    ) -> Result<Self, RpcError> {
        let control = subscribe_inbox(transport).await?;
        let control_subject = control.subject().to_string();
        let stop = CancellationToken::new();
        watch_peer(control, ctx.cancel_token().clone(), stop.clone());
        let sender = StreamSender::new(
            transport.clone(),
            reply,
            codec,
            Some(control_subject),
            ctx.cancel_token().clone(),
        );
        Ok(Self { inner: Arc::new(SendShared { sender: Mutex::new(sender), _watch: stop.drop_guard() }) })
    }

    #[inline]
    pub async fn send(&self, msg: &T) -> Result<(), RpcError> {
        self.inner.sender.lock().await.send(msg).await
    }

    /// Messages sent so far.
    #[inline]
    pub async fn sent(&self) -> u64 {
        self.inner.sender.lock().await.seq()
    }

    /// Emit the end marker. Called by the dispatcher with the handler's result.
    #[doc(hidden)]
    pub async fn finish(&self, result: Result<(), ErrorEnvelope>, headers: Headers) {
        let mut sender = self.inner.sender.lock().await;
        if let Err(e) = sender.close(result.as_ref().err(), headers).await {
            warn!("{:?} end marker not delivered: {}", sender, e);
        }
    }
}

struct RecvShared<T> {
    receiver: Mutex<StreamReceiver<T>>,
    /// Cancelled by `finish`, wakes a reader parked in `recv`
    done: CancellationToken,
}

/// Receives from the caller until its end marker.
pub struct ServerRecvStream<T> {
    inner: Arc<RecvShared<T>>,
}

impl<T> Clone for ServerRecvStream<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: DeserializeOwned> ServerRecvStream<T> {
    fn new(receiver: StreamReceiver<T>) -> Self {
        Self {
            inner: Arc::new(RecvShared {
                receiver: Mutex::new(receiver),
                done: CancellationToken::new(),
            }),
        }
    }

    /// `Ok(None)` at the caller's end of input, or once the call has finished.
    pub async fn recv(&self) -> Result<Option<T>, RpcError> {
        let done = &self.inner.done;
        if done.is_cancelled() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = done.cancelled() => Ok(None),
            res = async { self.inner.receiver.lock().await.recv().await } => res,
        }
    }

    /// Wake any parked reader, then release the subscription.
    #[doc(hidden)]
    pub async fn finish(&self) {
        self.inner.done.cancel();
        self.inner.receiver.lock().await.close();
    }
}

pub struct ServerBidiStream<Req, Resp> {
    rx: ServerRecvStream<Req>,
    tx: ServerSendStream<Resp>,
}

impl<Req, Resp> Clone for ServerBidiStream<Req, Resp> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone(), tx: self.tx.clone() }
    }
}

impl<Req: DeserializeOwned, Resp: Serialize> ServerBidiStream<Req, Resp> {
    #[inline]
    pub async fn recv(&self) -> Result<Option<Req>, RpcError> {
        self.rx.recv().await
    }

    #[inline]
    pub async fn send(&self, msg: &Resp) -> Result<(), RpcError> {
        self.tx.send(msg).await
    }

    #[inline]
    pub fn split(&self) -> (ServerRecvStream<Req>, ServerSendStream<Resp>) {
        (self.rx.clone(), self.tx.clone())
    }

    /// The end marker goes out first, the receive half is torn down after.
    #[doc(hidden)]
    pub async fn finish(&self, result: Result<(), ErrorEnvelope>, headers: Headers) {
        self.tx.finish(result, headers).await;
        self.rx.finish().await;
    }
}

/// Accept a server-streaming call. The request itself is the opening message's body.
pub async fn accept_server_stream<Resp: Serialize>(
    transport: &Arc<dyn Transport>, msg: &Message, codec: AnyCodec, ctx: &CallContext,
) -> Result<ServerSendStream<Resp>, RpcError> {
    let reply = reply_inbox(msg)?;
    ServerSendStream::new(transport, reply, codec, ctx).await
}

/// Receive half of a client-streaming call, plus the caller inbox the response goes to.
pub struct ClientStreamAccept<Req> {
    pub stream: ServerRecvStream<Req>,
    pub reply: String,
}

async fn accept_inbound<Req: DeserializeOwned>(
    transport: &Arc<dyn Transport>, reply: &str, codec: AnyCodec, ctx: &CallContext,
    idle_timeout: Option<Duration>,
) -> Result<ServerRecvStream<Req>, RpcError> {
    let sub = subscribe_inbox(transport).await?;
    let hs = proto::handshake_frame(reply, sub.subject());
    if let Err(e) = transport.publish(hs).await {
        return Err(RpcError::unavailable(format!("handshake to {}: {}", reply, e)));
    }
    let rx = StreamReceiver::new(sub, codec, ctx.clone(), idle_timeout);
    Ok(ServerRecvStream::new(rx))
}

/// Accept a client-streaming call: announce our inbox to the caller.
pub async fn accept_client_stream<Req: DeserializeOwned>(
    transport: &Arc<dyn Transport>, msg: &Message, codec: AnyCodec, ctx: &CallContext,
    idle_timeout: Option<Duration>,
) -> Result<ClientStreamAccept<Req>, RpcError> {
    let reply = reply_inbox(msg)?;
    let stream = accept_inbound(transport, &reply, codec, ctx, idle_timeout).await?;
    Ok(ClientStreamAccept { stream, reply })
}

/// Send the single response of a client-streaming call.
pub async fn reply_aggregate(
    transport: &Arc<dyn Transport>, reply: &str, result: Result<Bytes, ErrorEnvelope>,
    headers: Headers,
) {
    let frame = match &result {
        Ok(payload) => proto::data_frame(reply, 1, payload.clone(), headers),
        Err(e) => proto::end_frame(reply, 1, Some(e), headers),
    };
    if let Err(e) = transport.publish(frame).await {
        warn!("client stream response to {} not delivered: {}", reply, e);
    }
}

/// Accept a bidirectional call.
pub async fn accept_bidi<Req: DeserializeOwned, Resp: Serialize>(
    transport: &Arc<dyn Transport>, msg: &Message, codec: AnyCodec, ctx: &CallContext,
    idle_timeout: Option<Duration>,
) -> Result<ServerBidiStream<Req, Resp>, RpcError> {
    let reply = reply_inbox(msg)?;
    let rx = accept_inbound(transport, &reply, codec, ctx, idle_timeout).await?;
    let tx = ServerSendStream::new(transport, reply, codec, ctx).await?;
    Ok(ServerBidiStream { rx, tx })
}

/// Refuse a streaming call before it starts, e.g. when its request cannot be decoded.
pub async fn reject(transport: &Arc<dyn Transport>, msg: &Message, err: &ErrorEnvelope) {
    if let Some(reply) = proto::reply_to(msg) {
        if let Err(e) = transport.publish(proto::error_frame(reply, err)).await {
            warn!("stream rejection to {} not delivered: {}", reply, e);
        }
    }
}
