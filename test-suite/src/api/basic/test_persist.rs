use crate::api::service::*;
use crate::*;
use micro_rpc::{CallContext, ConfigError, Encoding, EndpointDescriptor, ErrorEnvelope, PersistenceRule};
use micro_rpc::{Service, ServiceDescriptor, Stores};
use micro_rpc_core::store::{BlobStore, KvStore};
use micro_rpc_mem::{MemBlobStore, MemKvStore};
use std::sync::Arc;

#[logfn]
#[rstest]
#[case(Encoding::Binary)]
#[case(Encoding::Text)]
fn test_kv_persistence(runner: TestRunner, #[case] encoding: Encoding) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let stores = Stores { kv: Some(kv.clone()), blob: None };
        let _svc = start_users(transport.clone(), encoding, stores).await;
        let client = users_client(transport, encoding).with_kv_store(kv.clone()).build().expect("client");
        let ctx = CallContext::new();
        let req = GetProfileRequest { id: "42".to_string() };

        let key = client.persisted_key("GetProfile", &req).expect("key");
        assert_eq!(key, "user.42");
        let e = client.read_direct::<Profile>("GetProfile", &key).await.expect_err("nothing yet");
        assert!(e.is("NOT_FOUND"));

        let p: Profile = client.call("GetProfile", &req, &ctx).await.expect("get");
        // Written before the reply went out
        assert_eq!(client.read_direct::<Profile>("GetProfile", &key).await.expect("stored"), p);
        let entry = kv.get("user_profiles", "user.42").await.expect("kv").expect("entry");
        assert_eq!(entry.revision, 1);

        let update = UpdateProfileRequest { id: "42".to_string(), name: "Augusta".to_string() };
        let _: Profile = client.call("UpdateProfile", &update, &ctx).await.expect("update");
        let p2: Profile = client.call("GetProfile", &req, &ctx).await.expect("get");
        let history = client.history::<Profile>("GetProfile", &key).await.expect("history");
        assert_eq!(history, vec![p, p2.clone()]);
        assert_eq!(client.read_direct::<Profile>("GetProfile", &key).await.expect("latest"), p2);

        // A failed call persists nothing
        let missing = GetProfileRequest { id: "404".to_string() };
        assert!(client.call::<_, Profile>("GetProfile", &missing, &ctx).await.is_err());
        assert_eq!(kv.get("user_profiles", "user.404").await.expect("kv"), None);
    });
}

#[logfn]
#[rstest]
fn test_blob_persistence(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let blob: Arc<dyn BlobStore> = Arc::new(MemBlobStore::with_chunk_size(8));
        let stores = Stores { kv: None, blob: Some(blob.clone()) };
        let _svc = start_users(transport.clone(), Encoding::Text, stores).await;
        let client = users_client(transport, Encoding::Text).with_blob_store(blob.clone()).build().expect("client");
        let req = ExportRequest { user_id: "7".to_string(), format: "csv".to_string() };
        let r: ExportResult = client.call("ExportUser", &req, &CallContext::new()).await.expect("export");
        let key = client.persisted_key("ExportUser", &req).expect("key");
        assert_eq!(key, "export.7.csv");
        assert_eq!(client.read_direct::<ExportResult>("ExportUser", &key).await.expect("stored"), r);
        let info = blob.info("exports", &key).await.expect("blob").expect("info");
        assert!(info.chunks > 1);
        assert!(info.digest.starts_with("SHA-256="));

        // Direct writes land where the service would have written
        let manual = ExportResult { user_id: "9".to_string(), rows: vec![] };
        client.write_direct("ExportUser", "export.9.json", &manual).await.expect("write");
        assert_eq!(client.read_direct::<ExportResult>("ExportUser", "export.9.json").await.expect("read"), manual);
    });
}

#[logfn]
#[rstest]
fn test_missing_store_degrades(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        // Service without any store still serves persisted endpoints
        let _svc = start_users(transport.clone(), Encoding::Binary, Stores::default()).await;
        let req = GetProfileRequest { id: "42".to_string() };

        let bare = users_client(transport.clone(), Encoding::Binary).build().expect("client");
        let p: Profile = bare.call("GetProfile", &req, &CallContext::new()).await.expect("get");
        assert_eq!(p.id, "42");
        let e = bare.read_direct::<Profile>("GetProfile", "user.42").await.expect_err("no store");
        assert!(e.is("UNAVAILABLE"));
        let e = bare.write_direct("GetProfile", "user.42", &p).await.expect_err("no store");
        assert!(e.is("UNAVAILABLE"));

        let with_kv = users_client(transport, Encoding::Binary)
            .with_kv_store(Arc::new(MemKvStore::new()))
            .build()
            .expect("client");
        let e = with_kv.read_direct::<Profile>("GetProfile", "user.42").await.expect_err("never written");
        assert!(e.is("NOT_FOUND"));
    });
}

#[derive(serde_derive::Serialize, serde_derive::Deserialize, Debug)]
struct GetUserRequest {
    id: String,
}

#[logfn]
#[rstest]
fn test_bad_key_field(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        let desc = ServiceDescriptor::builder("UserService")
            .endpoint(
                EndpointDescriptor::unary("GetUser")
                    .with_persistence(PersistenceRule::key_value("users", "user.{bad_field}")),
            )
            .build()
            .expect("template syntax is fine");
        let res = Service::builder(desc, transport.clone())
            .unary("GetUser", |_ctx: CallContext, req: GetUserRequest| async move { Ok::<_, ErrorEnvelope>(req.id) });
        let e = match res {
            Ok(_) => panic!("bad_field accepted"),
            Err(e) => e,
        };
        assert!(matches!(e, ConfigError::UnknownKeyField { .. }));
        let text = e.to_string();
        assert!(text.contains("bad_field"), "{}", text);
        assert!(text.contains("GetUserRequest"), "{}", text);
        assert!(text.contains("[id]"), "{}", text);
        assert_eq!(bus.subscription_count(), 0);

        let bad = ServiceDescriptor::builder("UserService")
            .endpoint(
                EndpointDescriptor::server_stream("Watch")
                    .with_persistence(PersistenceRule::key_value("users", "user.{id}")),
            )
            .build();
        assert!(matches!(bad, Err(ConfigError::UnsupportedPersistence { .. })));
        let bad = ServiceDescriptor::builder("UserService")
            .endpoint(
                EndpointDescriptor::unary("GetUser").with_persistence(PersistenceRule::key_value("users", "user.{id")),
            )
            .build();
        assert!(matches!(bad, Err(ConfigError::InvalidKeyTemplate { .. })));
    });
}
