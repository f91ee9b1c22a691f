use bytes::Bytes;
use micro_rpc::{
    CallContext, Client, ClientBuilder, EndpointDescriptor, Encoding, ErrorEnvelope, PersistenceRule,
    Service, ServiceBuilder, ServiceDescriptor, Stores,
};
use micro_rpc_core::Transport;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const QUOTA_EXCEEDED: &'static str = "QUOTA_EXCEEDED";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GetProfileRequest {
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateProfileRequest {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub user_id: String,
    pub format: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportResult {
    pub user_id: String,
    pub rows: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SlowRequest {
    pub millis: u64,
}

pub fn user_descriptor(encoding: Encoding) -> ServiceDescriptor {
    ServiceDescriptor::builder("UserService")
        .version("2.1.0")
        .description("user profiles")
        .timeout(Duration::from_secs(5))
        .metadata("team", "accounts")
        .declare_error(QUOTA_EXCEEDED)
        .encoding(encoding)
        .endpoint(
            EndpointDescriptor::unary("GetProfile")
                .with_persistence(PersistenceRule::key_value("user_profiles", "user.{id}").with_history(5)),
        )
        .endpoint(EndpointDescriptor::unary("UpdateProfile"))
        .endpoint(
            EndpointDescriptor::unary("ExportUser")
                .with_persistence(PersistenceRule::blob("exports", "export.{user_id}.{format}")),
        )
        .endpoint(EndpointDescriptor::unary("Whoami"))
        .endpoint(EndpointDescriptor::unary("CheckQuota"))
        .endpoint(EndpointDescriptor::unary("Mystery"))
        .endpoint(EndpointDescriptor::unary("Explode"))
        .endpoint(EndpointDescriptor::unary("Slow").with_timeout(Duration::from_millis(300)))
        .endpoint(EndpointDescriptor::unary("Migrate").skip())
        .build()
        .expect("descriptor")
}

/// In-memory profiles the handlers read and update.
#[derive(Clone, Default)]
pub struct UserDirectory {
    profiles: Arc<Mutex<BTreeMap<String, Profile>>>,
}

impl UserDirectory {
    pub fn seeded() -> Self {
        let dir = Self::default();
        {
            let mut profiles = dir.profiles.lock().unwrap();
            for (id, name) in [("42", "Ada"), ("7", "Grace")] {
                profiles.insert(
                    id.to_string(),
                    Profile {
                        id: id.to_string(),
                        name: name.to_string(),
                        email: format!("{}@example.com", name.to_lowercase()),
                    },
                );
            }
        }
        dir
    }

    fn get(&self, id: &str) -> Result<Profile, ErrorEnvelope> {
        match self.profiles.lock().unwrap().get(id) {
            Some(p) => Ok(p.clone()),
            None => Err(ErrorEnvelope::not_found(format!("user {} not found", id))),
        }
    }

    fn update(&self, req: UpdateProfileRequest) -> Result<Profile, ErrorEnvelope> {
        match self.profiles.lock().unwrap().get_mut(&req.id) {
            Some(p) => {
                p.name = req.name;
                Ok(p.clone())
            }
            None => Err(ErrorEnvelope::not_found(format!("user {} not found", req.id))),
        }
    }
}

pub fn register_user_handlers(b: ServiceBuilder, dir: UserDirectory) -> ServiceBuilder {
    let (get_dir, update_dir) = (dir.clone(), dir);
    b.unary("GetProfile", move |_ctx: CallContext, req: GetProfileRequest| {
        let dir = get_dir.clone();
        async move { dir.get(&req.id) }
    })
    .and_then(|b| {
        b.unary("UpdateProfile", move |_ctx: CallContext, req: UpdateProfileRequest| {
            let dir = update_dir.clone();
            async move { dir.update(req) }
        })
    })
    .and_then(|b| {
        b.unary("ExportUser", |_ctx: CallContext, req: ExportRequest| async move {
            match req.format.as_str() {
                "csv" | "json" => {}
                "xml" => anyhow::bail!("xml exporter is not installed"),
                other => anyhow::bail!(ErrorEnvelope::invalid_argument(format!("unknown format {}", other))),
            }
            let row = format!("{},{}", req.user_id, req.format);
            Ok(ExportResult { user_id: req.user_id, rows: vec![row] })
        })
    })
    .and_then(|b| {
        b.unary("Whoami", |ctx: CallContext, _req: GetProfileRequest| async move {
            ctx.set_response_header("X-Served-By", "users-1");
            match ctx.incoming_header("Authorization") {
                Some(token) => Ok(token),
                None => Err(ErrorEnvelope::unauthenticated("no token")),
            }
        })
    })
    .and_then(|b| {
        b.unary("CheckQuota", |_ctx: CallContext, req: GetProfileRequest| async move {
            Err::<Profile, _>(
                ErrorEnvelope::new(QUOTA_EXCEEDED, format!("user {} is over quota", req.id))
                    .with_data(Bytes::from_static(br#"{"limit":10}"#)),
            )
        })
    })
    .and_then(|b| {
        b.unary("Mystery", |_ctx: CallContext, _req: GetProfileRequest| async move {
            Err::<Profile, _>(
                ErrorEnvelope::new("MYSTERY", "something odd").with_data(Bytes::from_static(b"secret")),
            )
        })
    })
    .and_then(|b| {
        b.unary("Explode", |_ctx: CallContext, req: GetProfileRequest| async move {
            if !req.id.is_empty() {
                panic!("explode {}", req.id);
            }
            Ok::<Profile, ErrorEnvelope>(Profile { id: req.id, name: String::new(), email: String::new() })
        })
    })
    .and_then(|b| {
        b.unary("Slow", |_ctx: CallContext, req: SlowRequest| async move {
            tokio::time::sleep(Duration::from_millis(req.millis)).await;
            Ok::<_, ErrorEnvelope>(req.millis)
        })
    })
    .expect("register user handlers")
}

pub async fn start_users(transport: Arc<dyn Transport>, encoding: Encoding, stores: Stores) -> Service {
    let mut b = Service::builder(user_descriptor(encoding), transport);
    if let Some(kv) = stores.kv {
        b = b.with_kv_store(kv);
    }
    if let Some(blob) = stores.blob {
        b = b.with_blob_store(blob);
    }
    register_user_handlers(b, UserDirectory::seeded()).start().await.expect("start user service")
}

pub fn users_client(transport: Arc<dyn Transport>, encoding: Encoding) -> ClientBuilder {
    Client::builder(user_descriptor(encoding), transport)
}
