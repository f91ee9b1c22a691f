use crate::stream::service::*;
use crate::*;
use micro_rpc::{CallContext, ClientConfig, Encoding, Headers, ServerConfig};
use std::time::Duration;

#[logfn]
#[rstest]
#[case(Encoding::Binary)]
#[case(Encoding::Text)]
fn test_chat_echo(runner: TestRunner, #[case] encoding: Encoding) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), encoding, ServerConfig::default()).await;
        let client = counter_client(transport, encoding, ClientConfig::default());
        let ctx = CallContext::new();
        let mut chat = client.bidi::<ChatMessage, ChatMessage>("Chat", &ctx).await.expect("open");
        for text in ["hello", "world"] {
            chat.send(&ChatMessage { text: text.to_string() }).await.expect("send");
            let reply = chat.recv().await.expect("recv").expect("echo");
            assert_eq!(reply.text, format!("echo: {}", text));
        }
        chat.close_send().await.expect("close send");
        assert_eq!(chat.recv().await.expect("end"), None);
        assert_eq!(ctx.response_headers().get("X-Echoed"), Some("2"));
    });
}

#[logfn]
#[rstest]
fn test_chat_split(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let chat = client.bidi::<ChatMessage, ChatMessage>("Chat", &CallContext::new()).await.expect("open");
        let (mut tx, mut rx) = chat.into_split();
        let sender = tokio::spawn(async move {
            for i in 0..20 {
                tx.send(&ChatMessage { text: i.to_string() }).await.expect("send");
            }
            tx.close(None, Headers::new()).await.expect("close");
        });
        let mut replies = Vec::new();
        while let Some(msg) = rx.recv().await.expect("recv") {
            replies.push(msg.text);
        }
        sender.await.expect("sender");
        let expected: Vec<String> = (0..20).map(|i| format!("echo: {}", i)).collect();
        assert_eq!(replies, expected);
    });
}

#[logfn]
#[rstest]
fn test_handler_returns_before_reader(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        let mut relay = client.bidi::<ChatMessage, ChatMessage>("Relay", &ctx).await.expect("open");
        relay.send(&ChatMessage { text: "hi".to_string() }).await.expect("send");
        let first = relay.recv().await.expect("first");
        assert_eq!(first, Some(ChatMessage { text: "only".to_string() }));
        // The handler returned while its reader still waits for more input
        assert_eq!(relay.recv().await.expect("end"), None);
    });
}
