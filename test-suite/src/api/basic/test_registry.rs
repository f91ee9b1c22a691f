use crate::api::service::*;
use crate::*;
use micro_rpc::server::{PingInfo, ServiceInfo, ServiceStats};
use micro_rpc::{CallContext, Encoding, ServerConfig, Service, Stores};
use micro_rpc_core::transport::{self, Message, Transport};
use std::sync::Arc;
use std::time::Duration;

async fn discover<T: serde::de::DeserializeOwned>(transport: &Arc<dyn Transport>, subject: &str) -> T {
    let msg = Message::new(subject, Vec::new());
    let reply = transport::request(transport.as_ref(), msg, &CallContext::new(), Some(Duration::from_secs(1)))
        .await
        .expect("discovery reply");
    serde_json::from_slice(&reply.payload).expect("json")
}

#[logfn]
#[rstest]
fn test_discovery(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;

        let ping: PingInfo = discover(&transport, "$SRV.PING").await;
        assert_eq!(ping.name, "user_service");
        assert_eq!(ping.id, svc.id());
        assert_eq!(ping.version, "2.1.0");
        assert_eq!(ping.metadata.get("team").map(|s| s.as_str()), Some("accounts"));

        let info: ServiceInfo = discover(&transport, "$SRV.INFO.user_service").await;
        assert_eq!(info, svc.info());
        assert_eq!(info.description, "user profiles");
        assert_eq!(info.endpoints.len(), 8);
        assert_eq!(info.endpoints[1].subject, "user_service.update_profile");

        let by_id = format!("$SRV.STATS.user_service.{}", svc.id());
        let stats: ServiceStats = discover(&transport, &by_id).await;
        assert_eq!(stats.id, svc.id());
        assert!(stats.endpoints.iter().all(|e| e.num_requests == 0));

        // Other services and other instances stay quiet
        let e = transport::request(
            transport.as_ref(),
            Message::new("$SRV.PING.order_service", Vec::new()),
            &CallContext::new(),
            Some(Duration::from_secs(1)),
        )
        .await
        .expect_err("nobody");
        assert!(e.is("UNAVAILABLE"));
    });
}

#[logfn]
#[rstest]
fn test_discovery_disabled(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let config = ServerConfig { discovery: false, ..Default::default() };
        let b = Service::builder(user_descriptor(Encoding::Binary), transport.clone()).with_config(config);
        let _svc = register_user_handlers(b, UserDirectory::seeded()).start().await.expect("start");
        assert_eq!(bus.subscription_count(), 8);
    });
}

#[logfn]
#[rstest]
fn test_stats_and_reset(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let ctx = CallContext::new();
        for id in ["42", "7", "404"] {
            let _ = client.call::<_, Profile>("GetProfile", &GetProfileRequest { id: id.to_string() }, &ctx).await;
        }
        let stats = svc.stats();
        let get = &stats.endpoints[0];
        assert_eq!(get.name, "GetProfile");
        assert_eq!(get.subject, "user_service.get_profile");
        assert_eq!(get.num_requests, 3);
        assert_eq!(get.num_errors, 1);
        assert_eq!(get.last_error, "NOT_FOUND: user 404 not found");
        assert!(get.average_processing_time <= get.processing_time);

        svc.reset_stats();
        let stats = svc.stats();
        assert_eq!(stats.endpoints[0].num_requests, 0);
        assert_eq!(stats.endpoints[0].last_error, "");
        assert_eq!(stats.endpoints[0].subject, "user_service.get_profile");
    });
}

#[logfn]
#[rstest]
fn test_stop_drains_in_flight(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let in_flight = tokio::spawn({
            let client = client.clone();
            async move { client.call::<_, u64>("Slow", &SlowRequest { millis: 150 }, &CallContext::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(svc.stop().await);
        assert!(svc.is_stopped());
        assert_eq!(in_flight.await.expect("join").expect("drained call"), 150);
        assert_eq!(bus.subscription_count(), 0);
    });
}

#[logfn]
#[rstest]
fn test_stop_wait_expires(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let config = ServerConfig { stop_wait: Duration::from_millis(50), ..Default::default() };
        let b = Service::builder(user_descriptor(Encoding::Binary), transport.clone()).with_config(config);
        let svc = register_user_handlers(b, UserDirectory::seeded()).start().await.expect("start");
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let _in_flight = tokio::spawn(async move {
            let _ = client.call::<_, u64>("Slow", &SlowRequest { millis: 1000 }, &CallContext::new()).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!svc.stop().await);
    });
}
