use crate::api::service::*;
use crate::*;
use micro_rpc::{CallContext, ClientConfig, Encoding, RpcIntErr, Stores};
use std::time::Duration;

/// Cancel `ctx` from another task after `after`.
fn cancel_after(ctx: &CallContext, after: Duration) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        ctx.cancel();
    });
}

#[logfn]
#[rstest]
#[case(Encoding::Binary)]
#[case(Encoding::Text)]
fn test_declared_custom_code(runner: TestRunner, #[case] encoding: Encoding) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), encoding, Stores::default()).await;
        let client = users_client(transport, encoding).build().expect("client");
        let e = client
            .call::<_, Profile>("CheckQuota", &GetProfileRequest { id: "42".to_string() }, &CallContext::new())
            .await
            .expect_err("over quota");
        assert!(e.is(QUOTA_EXCEEDED));
        let env = e.envelope().expect("envelope");
        assert_eq!(env.message, "user 42 is over quota");
        assert_eq!(env.data.as_deref(), Some(&br#"{"limit":10}"#[..]));
    });
}

#[logfn]
#[rstest]
fn test_undeclared_code_becomes_internal(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let e = client
            .call::<_, Profile>("Mystery", &GetProfileRequest { id: "42".to_string() }, &CallContext::new())
            .await
            .expect_err("mystery");
        assert!(e.is("INTERNAL"));
        let env = e.envelope().expect("envelope");
        assert_eq!(env.message, "something odd");
        assert!(env.data.is_none());
        let stats = svc.stats();
        let mystery = stats.endpoints.iter().find(|s| s.name == "Mystery").expect("stats");
        assert_eq!(mystery.num_requests, 1);
        assert_eq!(mystery.num_errors, 1);
        assert_eq!(mystery.last_error, "INTERNAL: something odd");
    });
}

#[logfn]
#[rstest]
fn test_panic_becomes_internal(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let req = GetProfileRequest { id: "42".to_string() };
        for _ in 0..3 {
            let e = client.call::<_, Profile>("Explode", &req, &CallContext::new()).await.expect_err("panic");
            assert!(e.is("INTERNAL"));
        }
        // The endpoint loop survived
        let p: Profile = client.call("GetProfile", &req, &CallContext::new()).await.expect("still serving");
        assert_eq!(p.id, "42");
    });
}

#[logfn]
#[rstest]
fn test_timeouts(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport.clone(), Encoding::Binary).build().expect("client");

        // Endpoint timeout of 300ms beats the service's 5s
        let n: u64 = client.call("Slow", &SlowRequest { millis: 10 }, &CallContext::new()).await.expect("fast");
        assert_eq!(n, 10);
        let e = client
            .call::<_, u64>("Slow", &SlowRequest { millis: 1000 }, &CallContext::new())
            .await
            .expect_err("slow");
        assert!(e.is_timeout());
        assert_eq!(e, RpcIntErr::Timeout);
        assert!(!e.is("INTERNAL"));

        // The runtime override beats the endpoint
        let config = ClientConfig { timeout: Some(Duration::from_secs(3)), ..Default::default() };
        let patient = users_client(transport, Encoding::Binary).with_config(config).build().expect("client");
        let n: u64 = patient.call("Slow", &SlowRequest { millis: 500 }, &CallContext::new()).await.expect("patient");
        assert_eq!(n, 500);

        // A context deadline shorter than the resolved timeout wins
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let e = patient.call::<_, u64>("Slow", &SlowRequest { millis: 500 }, &ctx).await.expect_err("deadline");
        assert!(e.is_timeout());
    });
}

#[logfn]
#[rstest]
fn test_cancelled(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let ctx = CallContext::new();
        cancel_after(&ctx, Duration::from_millis(50));
        let e = client.call::<_, u64>("Slow", &SlowRequest { millis: 250 }, &ctx).await.expect_err("cancelled");
        assert_eq!(e, RpcIntErr::Cancelled);
        assert!(!e.is_timeout());
    });
}

#[logfn]
#[rstest]
fn test_anyhow_handler_errors(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let ctx = CallContext::new();
        // An envelope wrapped in anyhow keeps its code
        let req = ExportRequest { user_id: "7".to_string(), format: "pdf".to_string() };
        let e = client.call::<_, ExportResult>("ExportUser", &req, &ctx).await.expect_err("pdf");
        assert!(e.is("INVALID_ARGUMENT"));
        assert_eq!(e.envelope().expect("envelope").message, "unknown format pdf");
        // Anything else is INTERNAL
        let req = ExportRequest { user_id: "7".to_string(), format: "xml".to_string() };
        let e = client.call::<_, ExportResult>("ExportUser", &req, &ctx).await.expect_err("xml");
        assert!(e.is("INTERNAL"));
        assert_eq!(e.envelope().expect("envelope").message, "xml exporter is not installed");
    });
}
