use crate::stream::service::*;
use crate::*;
use micro_rpc::{CallContext, ClientConfig, Encoding, ServerConfig};

#[logfn]
#[rstest]
#[case(Encoding::Binary)]
#[case(Encoding::Text)]
fn test_sum(runner: TestRunner, #[case] encoding: Encoding) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), encoding, ServerConfig::default()).await;
        let client = counter_client(transport, encoding, ClientConfig::default());
        let mut tx = client.client_stream::<Number, SumResult>("Sum", &CallContext::new()).await.expect("open");
        for value in [10, 20, 30] {
            tx.send(&Number { value }).await.expect("send");
        }
        let res = tx.close_and_recv().await.expect("sum");
        assert_eq!(res, SumResult { total: 60, count: 3 });
    });
}

#[logfn]
#[rstest]
fn test_sum_nothing(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let tx = client.client_stream::<Number, SumResult>("Sum", &CallContext::new()).await.expect("open");
        assert_eq!(tx.close_and_recv().await.expect("sum"), SumResult { total: 0, count: 0 });
    });
}

#[logfn]
#[rstest]
fn test_sum_rejects_negative(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_counter(transport.clone(), Encoding::Binary, ServerConfig::default()).await;
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let mut tx = client.client_stream::<Number, SumResult>("Sum", &CallContext::new()).await.expect("open");
        tx.send(&Number { value: 1 }).await.expect("send");
        tx.send(&Number { value: -4 }).await.expect("send");
        let e = tx.close_and_recv().await.expect_err("negative");
        assert!(e.is("INVALID_ARGUMENT"));
        assert_eq!(e.envelope().expect("envelope").message, "negative value -4");
    });
}

#[logfn]
#[rstest]
fn test_no_responders(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let e = client.client_stream::<Number, SumResult>("Sum", &CallContext::new()).await.expect_err("nobody");
        assert!(e.is("UNAVAILABLE"));
        assert_eq!(bus.subscription_count(), 0);
    });
}

#[logfn]
#[rstest]
fn test_wrong_shape(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let client = counter_client(transport, Encoding::Binary, ClientConfig::default());
        let e = client.client_stream::<Number, SumResult>("CountUp", &CallContext::new()).await.expect_err("shape");
        assert!(e.is("INVALID_ARGUMENT"));
        let e = client
            .call::<_, SumResult>("Sum", &Number { value: 1 }, &CallContext::new())
            .await
            .expect_err("not unary");
        assert!(e.is("INVALID_ARGUMENT"));
    });
}
