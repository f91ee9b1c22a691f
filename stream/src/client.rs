//! Caller side of the three streaming shapes.
//!
//! - [server_stream]: publish one request, then [ClientRecvStream::recv] until the end marker.
//! - [client_stream]: handshake, [ClientSendStream::send] repeatedly, then
//!   [ClientSendStream::close_and_recv] for the single response.
//! - [bidi_stream]: handshake, then send and receive freely on a [ClientBidiStream].
//!
//! Every handle owns its reply inbox; dropping the handle releases it.

use crate::proto::{self, Frame};
use crate::session::{StreamReceiver, StreamSender};
use bytes::Bytes;
use micro_rpc_codec::{AnyCodec, Codec};
use micro_rpc_core::header::Headers;
use micro_rpc_core::transport::{Subscription, Transport};
use micro_rpc_core::{CallContext, RpcError, RpcIntErr};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Per-call settings resolved by the caller.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub subject: String,
    pub codec: AnyCodec,
    /// Bounds the handshake, and each receive when `idle_timeout` is unset
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl StreamOptions {
    #[inline]
    fn recv_timeout(&self) -> Option<Duration> {
        self.idle_timeout.or(self.timeout)
    }
}

async fn open(
    transport: &Arc<dyn Transport>, opts: &StreamOptions, ctx: &CallContext, payload: Bytes,
) -> Result<(Subscription, String), RpcError> {
    let inbox = transport.new_inbox();
    let sub = match transport.subscribe(&inbox, None).await {
        Ok(sub) => sub,
        Err(e) => return Err(RpcError::unavailable(format!("subscribe {}: {}", inbox, e))),
    };
    let frame = proto::open_frame(&opts.subject, &inbox, payload, ctx.seal_outgoing());
    if let Err(e) = transport.publish(frame).await {
        return Err(RpcError::unavailable(format!("publish {}: {}", opts.subject, e)));
    }
    Ok((sub, inbox))
}

/// Open, then wait for the server to announce its inbox.
async fn handshake(
    transport: &Arc<dyn Transport>, opts: &StreamOptions, ctx: &CallContext,
) -> Result<(Subscription, String, String), RpcError> {
    let (sub, inbox) = open(transport, opts, ctx, Bytes::new()).await?;
    let msg = sub.next_until(ctx, opts.timeout).await?;
    match Frame::parse(&msg) {
        Frame::Handshake { inbox: server_inbox } => {
            trace!("{} handshake: server inbox {}", opts.subject, server_inbox);
            return Ok((sub, inbox, server_inbox));
        }
        Frame::NoResponders => {
            return Err(RpcError::unavailable(format!("no responders on {}", opts.subject)));
        }
        Frame::Error(e) | Frame::End { err: Some(e), .. } => return Err(e.into()),
        other => {
            warn!("{} expect handshake, got {:?}", opts.subject, other);
            return Err(RpcIntErr::Decode.into());
        }
    }
}

fn encode<T: Serialize>(codec: &AnyCodec, msg: &T) -> Result<Bytes, RpcError> {
    match codec.encode(msg) {
        Ok(buf) => Ok(Bytes::from(buf)),
        Err(()) => Err(RpcIntErr::Encode.into()),
    }
}

/// Start a server-streaming call.
pub async fn server_stream<Req: Serialize, Resp: DeserializeOwned>(
    transport: Arc<dyn Transport>, opts: &StreamOptions, ctx: &CallContext, req: &Req,
) -> Result<ClientRecvStream<Resp>, RpcError> {
    let payload = encode(&opts.codec, req)?;
    let (sub, _inbox) = open(&transport, opts, ctx, payload).await?;
    let rx = StreamReceiver::new(sub, opts.codec, ctx.clone(), opts.recv_timeout());
    Ok(ClientRecvStream { rx })
}

/// Start a client-streaming call.
pub async fn client_stream<Req: Serialize, Resp: DeserializeOwned>(
    transport: Arc<dyn Transport>, opts: &StreamOptions, ctx: &CallContext,
) -> Result<ClientSendStream<Req, Resp>, RpcError> {
    let (sub, inbox, server_inbox) = handshake(&transport, opts, ctx).await?;
    let rx = StreamReceiver::new(sub, opts.codec, ctx.clone(), opts.recv_timeout());
    let tx = StreamSender::new(
        transport,
        server_inbox,
        opts.codec,
        Some(inbox),
        ctx.cancel_token().clone(),
    );
    Ok(ClientSendStream { tx, rx })
}

/// Start a bidirectional call.
pub async fn bidi_stream<Req: Serialize, Resp: DeserializeOwned>(
    transport: Arc<dyn Transport>, opts: &StreamOptions, ctx: &CallContext,
) -> Result<ClientBidiStream<Req, Resp>, RpcError> {
    let (sub, inbox, server_inbox) = handshake(&transport, opts, ctx).await?;
    let rx = StreamReceiver::new(sub, opts.codec, ctx.clone(), opts.recv_timeout());
    let tx = StreamSender::new(
        transport,
        server_inbox,
        opts.codec,
        Some(inbox),
        ctx.cancel_token().clone(),
    );
    Ok(ClientBidiStream { tx, rx })
}

#[derive(Debug)]
pub struct ClientRecvStream<Resp> {
    rx: StreamReceiver<Resp>,
}

impl<Resp: DeserializeOwned> ClientRecvStream<Resp> {
    /// `Ok(None)` once the server ended the stream normally.
    #[inline]
    pub async fn recv(&mut self) -> Result<Option<Resp>, RpcError> {
        self.rx.recv().await
    }

    /// Stop listening. The server notices on its next send.
    #[inline]
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Debug)]
pub struct ClientSendStream<Req, Resp> {
    tx: StreamSender<Req>,
    rx: StreamReceiver<Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientSendStream<Req, Resp> {
    #[inline]
    pub async fn send(&mut self, msg: &Req) -> Result<(), RpcError> {
        self.tx.send(msg).await
    }

    /// Signal end of input and wait for the aggregated response.
    pub async fn close_and_recv(mut self) -> Result<Resp, RpcError> {
        self.tx.close(None, Headers::new()).await?;
        match self.rx.recv().await? {
            Some(resp) => {
                self.rx.close();
                Ok(resp)
            }
            None => {
                warn!("{:?} ended without a response", self.rx);
                Err(RpcIntErr::InvalidState.into())
            }
        }
    }
}

#[derive(Debug)]
pub struct ClientBidiStream<Req, Resp> {
    tx: StreamSender<Req>,
    rx: StreamReceiver<Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientBidiStream<Req, Resp> {
    #[inline]
    pub async fn send(&mut self, msg: &Req) -> Result<(), RpcError> {
        self.tx.send(msg).await
    }

    #[inline]
    pub async fn recv(&mut self) -> Result<Option<Resp>, RpcError> {
        self.rx.recv().await
    }

    /// No more outgoing messages, receiving goes on.
    #[inline]
    pub async fn close_send(&mut self) -> Result<(), RpcError> {
        self.tx.close(None, Headers::new()).await
    }

    /// Release everything. Sends the end marker first if `close_send` was not called.
    pub async fn close(&mut self) -> Result<(), RpcError> {
        let res = self.tx.close(None, Headers::new()).await;
        self.rx.close();
        res
    }

    /// Split into halves that can be driven from different tasks.
    #[inline]
    pub fn into_split(self) -> (StreamSender<Req>, StreamReceiver<Resp>) {
        (self.tx, self.rx)
    }
}
