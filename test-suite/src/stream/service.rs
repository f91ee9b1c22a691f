use micro_rpc::{
    CallContext, Client, ClientConfig, EndpointDescriptor, Encoding, ErrorEnvelope, RpcError, ServerBidiStream,
    ServerConfig, ServerRecvStream, ServerSendStream, Service, ServiceDescriptor,
};
use micro_rpc_core::Transport;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const LIMIT_EXCEEDED: &'static str = "LIMIT_EXCEEDED";

/// Largest `count` CountUp serves in full.
pub const COUNT_LIMIT: u32 = 100;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CountRequest {
    pub start: i64,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CountValue {
    pub value: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Number {
    pub value: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SumResult {
    pub total: i64,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub text: String,
}

pub fn counter_descriptor(encoding: Encoding) -> ServiceDescriptor {
    ServiceDescriptor::builder("CounterService")
        .timeout(Duration::from_secs(2))
        .declare_error(LIMIT_EXCEEDED)
        .encoding(encoding)
        .endpoint(EndpointDescriptor::server_stream("CountUp"))
        .endpoint(EndpointDescriptor::server_stream("Stall"))
        .endpoint(EndpointDescriptor::server_stream("Crash"))
        .endpoint(EndpointDescriptor::client_stream("Sum"))
        .endpoint(EndpointDescriptor::bidi("Chat"))
        .endpoint(EndpointDescriptor::bidi("Relay"))
        .build()
        .expect("descriptor")
}

async fn count_up(ctx: CallContext, req: CountRequest, tx: ServerSendStream<CountValue>) -> Result<(), RpcError> {
    let served = req.count.min(COUNT_LIMIT);
    for i in 0..served {
        tx.send(&CountValue { value: req.start + i as i64 }).await?;
    }
    ctx.set_response_header("X-Count", served.to_string());
    if req.count > COUNT_LIMIT {
        return Err(ErrorEnvelope::new(LIMIT_EXCEEDED, format!("count {} over {}", req.count, COUNT_LIMIT)).into());
    }
    Ok(())
}

async fn stall(_ctx: CallContext, req: CountRequest, tx: ServerSendStream<CountValue>) -> Result<(), RpcError> {
    tx.send(&CountValue { value: req.start }).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    Ok(())
}

async fn crash(_ctx: CallContext, req: CountRequest, tx: ServerSendStream<CountValue>) -> Result<(), RpcError> {
    tx.send(&CountValue { value: req.start }).await?;
    if req.count > 0 {
        panic!("crash after {}", req.start);
    }
    Ok(())
}

async fn sum(_ctx: CallContext, rx: ServerRecvStream<Number>) -> Result<SumResult, RpcError> {
    let mut res = SumResult { total: 0, count: 0 };
    while let Some(n) = rx.recv().await? {
        if n.value < 0 {
            return Err(ErrorEnvelope::invalid_argument(format!("negative value {}", n.value)).into());
        }
        res.total += n.value;
        res.count += 1;
    }
    Ok(res)
}

async fn chat(ctx: CallContext, stream: ServerBidiStream<ChatMessage, ChatMessage>) -> Result<(), RpcError> {
    let mut echoed = 0;
    while let Some(msg) = stream.recv().await? {
        stream.send(&ChatMessage { text: format!("echo: {}", msg.text) }).await?;
        echoed += 1;
    }
    ctx.set_response_header("X-Echoed", echoed.to_string());
    Ok(())
}

/// Reads in the background and returns without waiting for the caller to stop sending.
async fn relay(_ctx: CallContext, stream: ServerBidiStream<ChatMessage, ChatMessage>) -> Result<(), RpcError> {
    let (rx, tx) = stream.split();
    tokio::spawn(async move { while let Ok(Some(_)) = rx.recv().await {} });
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(&ChatMessage { text: "only".to_string() }).await?;
    Ok(())
}

pub async fn start_counter(transport: Arc<dyn Transport>, encoding: Encoding, config: ServerConfig) -> Service {
    Service::builder(counter_descriptor(encoding), transport)
        .with_config(config)
        .server_stream("CountUp", count_up)
        .and_then(|b| b.server_stream("Stall", stall))
        .and_then(|b| b.server_stream("Crash", crash))
        .and_then(|b| b.client_stream("Sum", sum))
        .and_then(|b| b.bidi("Chat", chat))
        .and_then(|b| b.bidi("Relay", relay))
        .expect("register counter handlers")
        .start()
        .await
        .expect("start counter service")
}

pub fn counter_client(transport: Arc<dyn Transport>, encoding: Encoding, config: ClientConfig) -> Client {
    Client::builder(counter_descriptor(encoding), transport).with_config(config).build().expect("client")
}
