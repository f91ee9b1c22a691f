use crate::api::service::*;
use crate::*;
use futures::FutureExt;
use bytes::Bytes;
use futures::future::BoxFuture;
use micro_rpc::{
    CallContext, ClientCall, Encoding, ErrorEnvelope, RpcError, Service, ServerCall, UnaryHandler, UnaryInvoker,
};
use std::sync::{Arc, Mutex};

type Trace = Arc<Mutex<Vec<String>>>;

fn server_recorder(name: &'static str, trace: Trace) -> impl micro_rpc::ServerInterceptor {
    move |call: ServerCall, next: UnaryHandler| {
        let trace = trace.clone();
        async move {
            trace.lock().unwrap().push(format!("{} before {}", name, call.info.method));
            let res = next(call).await;
            trace.lock().unwrap().push(format!("{} after", name));
            res
        }
        .boxed()
    }
}

/// Rejects calls without an Authorization header before they reach the handler.
fn require_token(call: ServerCall, next: UnaryHandler) -> BoxFuture<'static, Result<Bytes, ErrorEnvelope>> {
    async move {
        match call.ctx.incoming_header("Authorization") {
            Some(token) if token.starts_with("Bearer ") => next(call).await,
            _ => Err(ErrorEnvelope::unauthenticated(format!("{} requires a token", call.info.method))),
        }
    }
    .boxed()
}

#[logfn]
#[rstest]
fn test_server_interceptor_order(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let b = Service::builder(user_descriptor(Encoding::Binary), transport.clone())
            .with_interceptor(server_recorder("outer", trace.clone()))
            .with_interceptor(server_recorder("inner", trace.clone()));
        let _svc = register_user_handlers(b, UserDirectory::seeded()).start().await.expect("start");
        let client = users_client(transport, Encoding::Binary).build().expect("client");
        let _: Profile = client
            .call("GetProfile", &GetProfileRequest { id: "42".to_string() }, &CallContext::new())
            .await
            .expect("get");
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["outer before GetProfile", "inner before GetProfile", "inner after", "outer after"]
        );
    });
}

#[logfn]
#[rstest]
fn test_auth_and_headers(runner: TestRunner) {
    runner.block_on(async move {
        let (_bus, transport) = new_bus();
        let b = Service::builder(user_descriptor(Encoding::Text), transport.clone()).with_interceptor(require_token);
        let _svc = register_user_handlers(b, UserDirectory::seeded()).start().await.expect("start");
        let req = GetProfileRequest { id: "42".to_string() };

        let anonymous = users_client(transport.clone(), Encoding::Text).build().expect("client");
        let e = anonymous.call::<_, String>("Whoami", &req, &CallContext::new()).await.expect_err("no token");
        assert!(e.is("UNAUTHENTICATED"));
        assert_eq!(e.envelope().expect("envelope").message, "Whoami requires a token");

        // Header set on the context by the caller
        let ctx = CallContext::new();
        assert!(ctx.set_header("Authorization", "Bearer ctx-token"));
        let who: String = anonymous.call("Whoami", &req, &ctx).await.expect("whoami");
        assert_eq!(who, "Bearer ctx-token");
        assert_eq!(ctx.response_headers().get("X-Served-By"), Some("users-1"));
        // Outgoing headers are sealed once sent
        assert!(!ctx.set_header("Authorization", "Bearer late"));

        // Header injected by a client interceptor, which also sees the resolved subject
        let seen: Trace = Arc::new(Mutex::new(Vec::new()));
        let seen_by_ic = seen.clone();
        let with_token = users_client(transport, Encoding::Text)
            .with_interceptor(move |call: ClientCall, next: UnaryInvoker| {
                seen_by_ic.lock().unwrap().push(call.subject.clone());
                call.ctx.set_header("Authorization", "Bearer ic-token");
                next(call)
            })
            .build()
            .expect("client");
        let who: String = with_token.call("Whoami", &req, &CallContext::new()).await.expect("whoami");
        assert_eq!(who, "Bearer ic-token");
        assert_eq!(*seen.lock().unwrap(), vec!["user_service.whoami"]);
    });
}

#[logfn]
#[rstest]
fn test_client_short_circuit(runner: TestRunner) {
    runner.block_on(async move {
        let (bus, transport) = new_bus();
        // No service at all: the interceptor answers before anything hits the bus
        let client = users_client(transport, Encoding::Binary)
            .with_interceptor(|call: ClientCall, _next: UnaryInvoker| {
                let e = ErrorEnvelope::permission_denied(format!("{} blocked locally", call.method));
                async move { Err::<Bytes, RpcError>(e.into()) }.boxed()
            })
            .build()
            .expect("client");
        let e = client
            .call::<_, Profile>("GetProfile", &GetProfileRequest { id: "42".to_string() }, &CallContext::new())
            .await
            .expect_err("blocked");
        assert!(e.is("PERMISSION_DENIED"));
        assert_eq!(bus.subscription_count(), 0);
    });
}
