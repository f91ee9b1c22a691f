use crate::api::service::*;
use crate::*;
use micro_rpc::{CallContext, Client, Encoding, ServiceDescriptor, Stores};

#[logfn]
#[rstest]
#[case(Encoding::Binary)]
#[case(Encoding::Text)]
fn test_unary_calls(runner: TestRunner, #[case] encoding: Encoding) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let svc = start_users(transport.clone(), encoding, Stores::default()).await;
        // 8 exposed endpoints, 9 discovery subjects
        assert_eq!(bus.subscription_count(), 17);
        let client = users_client(transport, encoding).build().expect("client");
        let ctx = CallContext::new();

        let p: Profile =
            client.call("GetProfile", &GetProfileRequest { id: "42".to_string() }, &ctx).await.expect("get");
        assert_eq!(p.name, "Ada");
        assert_eq!(p.email, "ada@example.com");

        let req = UpdateProfileRequest { id: "42".to_string(), name: "Augusta".to_string() };
        let p: Profile = client.call("UpdateProfile", &req, &ctx).await.expect("update");
        assert_eq!(p.name, "Augusta");
        let p: Profile =
            client.call("GetProfile", &GetProfileRequest { id: "42".to_string() }, &ctx).await.expect("get");
        assert_eq!(p.name, "Augusta");

        let req = ExportRequest { user_id: "7".to_string(), format: "csv".to_string() };
        let r: ExportResult = client.call("ExportUser", &req, &ctx).await.expect("export");
        assert_eq!(r.rows, vec!["7,csv".to_string()]);

        log::info!("{:?} served {:?}", svc, svc.stats());
        assert!(svc.stop().await);
        assert_eq!(bus.subscription_count(), 0);
    });
}

#[logfn]
#[rstest]
fn test_not_found_round_trip(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let e = client
            .call::<_, Profile>("GetProfile", &GetProfileRequest { id: "404".to_string() }, &CallContext::new())
            .await
            .expect_err("missing user");
        assert!(e.is("NOT_FOUND"));
        let env = e.envelope().expect("envelope");
        assert_eq!(env.message, "user 404 not found");
        assert!(env.data.is_none());
    });
}

#[logfn]
#[rstest]
fn test_skipped_and_unknown(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        assert!(svc.endpoints().iter().all(|e| e.name != "Migrate"));
        assert_eq!(svc.endpoints()[0].subject, "user_service.get_profile");
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let req = GetProfileRequest { id: "42".to_string() };
        let e = client.call::<_, Profile>("Migrate", &req, &CallContext::new()).await.expect_err("skipped");
        assert!(e.is("INVALID_ARGUMENT"));
        let e = client.call::<_, Profile>("DeleteProfile", &req, &CallContext::new()).await.expect_err("unknown");
        assert!(e.is("INVALID_ARGUMENT"));
    });
}

#[logfn]
#[rstest]
fn test_no_responders(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let client = users_client(transport.clone(), Encoding::Binary).build().expect("client");
        let req = GetProfileRequest { id: "42".to_string() };
        let e = client.call::<_, Profile>("GetProfile", &req, &CallContext::new()).await.expect_err("nobody");
        assert!(e.is("UNAVAILABLE"));

        // A service that is stopped no longer answers
        let svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let _: Profile = client.call("GetProfile", &req, &CallContext::new()).await.expect("served");
        assert!(svc.stop().await);
        let e = client.call::<_, Profile>("GetProfile", &req, &CallContext::new()).await.expect_err("stopped");
        assert!(e.is("UNAVAILABLE"));
        assert_eq!(bus.subscription_count(), 0);
    });
}

#[logfn]
#[rstest]
fn test_subject_prefix_override(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let server_config =
            micro_rpc::ServerConfig { subject_prefix: Some("eu.users".to_string()), ..Default::default() };
        let svc = register_user_handlers(
            micro_rpc::Service::builder(user_descriptor(Encoding::Binary), transport.clone())
                .with_config(server_config),
            UserDirectory::seeded(),
        )
        .start()
        .await
        .expect("start");
        assert_eq!(svc.endpoints()[0].subject, "eu.users.get_profile");
        let req = GetProfileRequest { id: "42".to_string() };

        let default_client = users_client(transport.clone(), Encoding::Binary).build().expect("client");
        let e = default_client.call::<_, Profile>("GetProfile", &req, &CallContext::new()).await.expect_err("moved");
        assert!(e.is("UNAVAILABLE"));

        let client_config =
            micro_rpc::ClientConfig { subject_prefix: Some("eu.users".to_string()), ..Default::default() };
        let client = users_client(transport, Encoding::Binary).with_config(client_config).build().expect("client");
        let p: Profile = client.call("GetProfile", &req, &CallContext::new()).await.expect("get");
        assert_eq!(p.id, "42");
    });
}

#[logfn]
#[rstest]
fn test_queue_group_spreads_load(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let a = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let b = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        assert_ne!(a.id(), b.id());
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        for _ in 0..20 {
            let _: Profile = client
                .call("GetProfile", &GetProfileRequest { id: "7".to_string() }, &CallContext::new())
                .await
                .expect("get");
        }
        let served = |svc: &micro_rpc::Service| svc.stats().endpoints[0].num_requests;
        assert_eq!(served(&a) + served(&b), 20);
        assert!(served(&a) > 0);
        assert!(served(&b) > 0);
    });
}

#[logfn]
#[rstest]
fn test_mismatched_encoding(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let _svc = start_users(transport.clone(), Encoding::Text, Stores::default()).await;
        // A client built from a descriptor disagreeing on the encoding sends bytes the service
        // cannot decode
        let desc: ServiceDescriptor = user_descriptor(Encoding::Binary);
        let client = Client::builder(desc, transport).build().expect("client");
        let e = client
            .call::<_, Profile>("GetProfile", &GetProfileRequest { id: "42".to_string() }, &CallContext::new())
            .await
            .expect_err("undecodable");
        assert!(e.is("INVALID_ARGUMENT"));
    });
}
