//! Introspection of a running service and the `$SRV` discovery responders.
//!
//! Discovery listens on `$SRV.{VERB}`, `$SRV.{VERB}.{name}` and `$SRV.{VERB}.{name}.{id}` for
//! each verb, without a queue group so every instance answers. Replies are JSON regardless of
//! the service's encoding.

use super::dispatch::{EndpointStats, ServiceShared};
use crate::subject::{self, EndpointInfo};
use micro_rpc_core::transport::{Message, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DISCOVERY_PREFIX: &'static str = "$SRV";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingInfo {
    pub name: String,
    pub id: String,
    pub version: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub id: String,
    pub version: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub name: String,
    pub id: String,
    pub version: String,
    pub endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
pub(crate) enum Verb {
    Ping,
    Info,
    Stats,
}

impl Verb {
    pub const ALL: [Verb; 3] = [Verb::Ping, Verb::Info, Verb::Stats];

    pub fn subjects(self, name: &str, id: &str) -> [String; 3] {
        [
            format!("{}.{}", DISCOVERY_PREFIX, self),
            format!("{}.{}.{}", DISCOVERY_PREFIX, self, name),
            format!("{}.{}.{}.{}", DISCOVERY_PREFIX, self, name, id),
        ]
    }
}

impl ServiceShared {
    pub fn endpoint_infos(&self) -> Vec<EndpointInfo> {
        subject::endpoint_infos(&self.desc, self.config.subject_prefix.as_deref())
    }

    pub fn ping(&self) -> PingInfo {
        PingInfo {
            name: self.desc.name.clone(),
            id: self.id.clone(),
            version: self.desc.version.clone(),
            metadata: self.desc.metadata.clone(),
        }
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.desc.name.clone(),
            id: self.id.clone(),
            version: self.desc.version.clone(),
            description: self.desc.description.clone(),
            metadata: self.desc.metadata.clone(),
            endpoints: self.endpoint_infos(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            name: self.desc.name.clone(),
            id: self.id.clone(),
            version: self.desc.version.clone(),
            endpoints: self.endpoints.iter().map(|ep| ep.stats.lock().unwrap().clone()).collect(),
        }
    }

    fn discovery_reply(&self, verb: Verb) -> Result<Vec<u8>, serde_json::Error> {
        match verb {
            Verb::Ping => serde_json::to_vec(&self.ping()),
            Verb::Info => serde_json::to_vec(&self.info()),
            Verb::Stats => serde_json::to_vec(&self.stats()),
        }
    }
}

pub(crate) async fn serve_discovery(shared: Arc<ServiceShared>, verb: Verb, sub: Subscription) {
    loop {
        let msg = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = sub.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let reply = match msg.reply {
            Some(reply) => reply,
            None => continue,
        };
        let body = match shared.discovery_reply(verb) {
            Ok(body) => body,
            Err(e) => {
                logger_error!(shared.logger, "{} {} reply: {}", shared.desc.name, verb, e);
                continue;
            }
        };
        logger_trace!(shared.logger, "{} answer {} on {}", shared.desc.name, verb, msg.subject);
        if let Err(e) = shared.transport.publish(Message::new(reply, body)).await {
            logger_warn!(shared.logger, "{} {} reply not delivered: {}", shared.desc.name, verb, e);
        }
    }
    sub.unsubscribe();
}
