use crate::stream::service::*;
use crate::*;
use micro_rpc::{CallContext, ClientConfig, Encoding, RpcIntErr, ServerConfig};
use std::time::Duration;

#[logfn]
#[rstest]
#[case(Encoding::Binary)]
#[case(Encoding::Text)]
fn test_count_up(runner: TestRunner, #[case] encoding: Encoding) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), encoding, ServerConfig::default()).await;
        let client = counter_client(transport, encoding, ClientConfig::default());
        let ctx = CallContext::new();
        let mut rx = client
            .server_stream::<_, CountValue>("CountUp", &CountRequest { start: 1, count: 3 }, &ctx)
            .await
            .expect("open");
        let mut values = Vec::new();
        while let Some(v) = rx.recv().await.expect("recv") {
            values.push(v.value);
        }
        assert_eq!(values, vec![1, 2, 3]);
        // Ended stays ended
        assert_eq!(rx.recv().await.expect("after end"), None);
        assert_eq!(ctx.response_headers().get("X-Count"), Some("3"));
    });
}

#[logfn]
#[rstest]
fn test_empty_stream(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let mut rx = client
            .server_stream::<_, CountValue>("CountUp", &CountRequest { start: 1, count: 0 }, &CallContext::new())
            .await
            .expect("open");
        assert_eq!(rx.recv().await.expect("end"), None);
    });
}

#[logfn]
#[rstest]
fn test_error_after_messages(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let req = CountRequest { start: 0, count: COUNT_LIMIT + 1 };
        let mut rx = client.server_stream::<_, CountValue>("CountUp", &req, &CallContext::new()).await.expect("open");
        let mut received = 0;
        let err = loop {
            match rx.recv().await {
                Ok(Some(v)) => {
                    assert_eq!(v.value, received);
                    received += 1;
                }
                Ok(None) => panic!("stream ended without the limit error"),
                Err(e) => break e,
            }
        };
        assert_eq!(received, COUNT_LIMIT as i64);
        assert!(err.is(LIMIT_EXCEEDED));
        assert_eq!(err.envelope().expect("envelope").message, "count 101 over 100");

        // The end marker goes out before the stats are recorded
        for _ in 0..50 {
            if svc.stats().endpoints[0].num_errors == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.stats().endpoints[0].num_errors, 1);
    });
}

#[logfn]
#[rstest]
fn test_handler_panic_ends_stream(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let mut rx = client
            .server_stream::<_, CountValue>("Crash", &CountRequest { start: 5, count: 1 }, &CallContext::new())
            .await
            .expect("open");
        assert_eq!(rx.recv().await.expect("first"), Some(CountValue { value: 5 }));
        let e = rx.recv().await.expect_err("panicked");
        assert!(e.is("INTERNAL"));
    });
}

#[logfn]
#[rstest]
fn test_idle_timeout(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let config = ClientConfig { stream_idle_timeout: Some(Duration::from_millis(100)), ..Default::default() };
        let client = counter_client(transport, Encoding::Binary, config);
        let mut rx = client
            .server_stream::<_, CountValue>("Stall", &CountRequest { start: 9, count: 2 }, &CallContext::new())
            .await
            .expect("open");
        assert_eq!(rx.recv().await.expect("first"), Some(CountValue { value: 9 }));
        let e = rx.recv().await.expect_err("stalled");
        assert_eq!(e, RpcIntErr::Timeout);
    });
}

#[logfn]
#[rstest]
fn test_no_responders(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let mut rx = client
            .server_stream::<_, CountValue>("CountUp", &CountRequest { start: 1, count: 3 }, &CallContext::new())
            .await
            .expect("open");
        let e = rx.recv().await.expect_err("nobody");
        assert!(e.is("UNAVAILABLE"));
        drop(rx);
        assert_eq!(bus.subscription_count(), 0);
    });
}
