//! Service and endpoint descriptors: the passive configuration a service runs with.
//!
//! Descriptors are produced ahead of time from an interface definition and handed over fully
//! resolved. They derive serde so they can be shipped as JSON. Once a service has started its
//! descriptor is never mutated.

use crate::key_template::KeyTemplate;
use micro_rpc_core::error::{Code, ConfigError};
use micro_rpc_core::store::PutOptions;
use micro_rpc_core::Encoding;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

pub const DEFAULT_VERSION: &'static str = "1.0.0";

/// Insert `_` before every uppercase letter except the first, then lowercase.
///
/// `GetProfile` becomes `get_profile`. Acronyms are not grouped: `GetHTTPStatus` becomes
/// `get_h_t_t_p_status`.
pub fn to_snake_case(name: &str) -> String {
    let mut s = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                s.push('_');
            }
            s.extend(c.to_lowercase());
        } else {
            s.push(c);
        }
    }
    s
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Shape {
    #[default]
    Unary,
    ServerStream,
    ClientStream,
    Bidi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StoreKind {
    #[serde(rename = "kv")]
    #[strum(serialize = "kv")]
    KeyValue,
    Blob,
}

/// Where the response of an endpoint is persisted after a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRule {
    pub kind: StoreKind,
    pub bucket: String,
    /// Literal text with `{field}` placeholders naming top-level request fields
    pub key_template: String,
    #[serde(default)]
    pub ttl: Option<Duration>,
    /// Revisions kept per key by stores supporting history, 0 means 1
    #[serde(default)]
    pub history: u32,
    /// Only the client reads and writes, the server never writes automatically
    #[serde(default)]
    pub client_only: bool,
}

impl PersistenceRule {
    pub fn key_value(bucket: impl Into<String>, key_template: impl Into<String>) -> Self {
        Self {
            kind: StoreKind::KeyValue,
            bucket: bucket.into(),
            key_template: key_template.into(),
            ttl: None,
            history: 0,
            client_only: false,
        }
    }

    pub fn blob(bucket: impl Into<String>, key_template: impl Into<String>) -> Self {
        Self { kind: StoreKind::Blob, ..Self::key_value(bucket, key_template) }
    }

    #[inline]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[inline]
    pub fn with_history(mut self, depth: u32) -> Self {
        self.history = depth;
        self
    }

    #[inline]
    pub fn client_only(mut self) -> Self {
        self.client_only = true;
        self
    }

    #[inline]
    pub fn template(&self) -> Result<KeyTemplate, ConfigError> {
        KeyTemplate::parse(&self.key_template)
    }

    #[inline]
    pub fn put_options(&self) -> PutOptions {
        PutOptions { ttl: self.ttl.filter(|d| !d.is_zero()), history: self.history.max(1) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Method name as declared, e.g. `GetProfile`
    pub name: String,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Not exposed on the bus, not callable
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub persistence: Option<PersistenceRule>,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            timeout: None,
            metadata: BTreeMap::new(),
            skip: false,
            persistence: None,
        }
    }

    #[inline]
    pub fn unary(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Unary)
    }

    #[inline]
    pub fn server_stream(name: impl Into<String>) -> Self {
        Self::new(name, Shape::ServerStream)
    }

    #[inline]
    pub fn client_stream(name: impl Into<String>) -> Self {
        Self::new(name, Shape::ClientStream)
    }

    #[inline]
    pub fn bidi(name: impl Into<String>) -> Self {
        Self::new(name, Shape::Bidi)
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    #[inline]
    pub fn with_persistence(mut self, rule: PersistenceRule) -> Self {
        self.persistence = Some(rule);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub subject_prefix: String,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Custom error codes handlers may reply with, besides the built-in set
    #[serde(default)]
    pub errors: BTreeSet<String>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

impl ServiceDescriptor {
    /// Start from a service type name, e.g. `UserService`, with defaults applied.
    pub fn builder(type_name: &str) -> ServiceDescriptorBuilder {
        let name = to_snake_case(type_name);
        ServiceDescriptorBuilder {
            desc: ServiceDescriptor {
                subject_prefix: name.clone(),
                name,
                version: DEFAULT_VERSION.to_string(),
                description: String::new(),
                timeout: None,
                metadata: BTreeMap::new(),
                errors: BTreeSet::new(),
                encoding: Encoding::default(),
                endpoints: Vec::new(),
            },
        }
    }

    #[inline]
    pub fn endpoint(&self, name: &str) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.name == name)
    }

    /// Endpoints exposed on the bus.
    #[inline]
    pub fn active_endpoints(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.iter().filter(|ep| !ep.skip)
    }

    /// Whether a handler may reply with `code`.
    #[inline]
    pub fn declares(&self, code: &str) -> bool {
        Code::is_builtin(code) || self.errors.contains(code)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::InvalidSubject(String::new()));
        }
        if !valid_prefix(&self.subject_prefix) {
            return Err(ConfigError::InvalidSubject(self.subject_prefix.clone()));
        }
        for code in &self.errors {
            if code.is_empty() || Code::is_builtin(code) {
                return Err(ConfigError::ReservedCode(code.clone()));
            }
        }
        let mut seen = BTreeSet::new();
        for ep in &self.endpoints {
            if ep.name.is_empty() || !valid_prefix(&ep.name) {
                return Err(ConfigError::InvalidSubject(format!("{}.{}", self.subject_prefix, ep.name)));
            }
            if !seen.insert(ep.name.as_str()) {
                return Err(ConfigError::DuplicateEndpoint {
                    service: self.name.clone(),
                    method: ep.name.clone(),
                });
            }
            if let Some(rule) = &ep.persistence {
                if ep.shape != Shape::Unary {
                    return Err(ConfigError::UnsupportedPersistence {
                        service: self.name.clone(),
                        method: ep.name.clone(),
                        shape: ep.shape.to_string(),
                    });
                }
                rule.template()?;
            }
        }
        Ok(())
    }
}

/// Dot separated tokens, none empty, no whitespace or wildcards.
pub(crate) fn valid_prefix(prefix: &str) -> bool {
    if prefix.is_empty() {
        return false;
    }
    prefix.split('.').all(|token| {
        !token.is_empty() && !token.chars().any(|c| c.is_whitespace() || c == '*' || c == '>')
    })
}

pub struct ServiceDescriptorBuilder {
    desc: ServiceDescriptor,
}

impl ServiceDescriptorBuilder {
    #[inline]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.desc.name = name.into();
        self
    }

    #[inline]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.desc.version = version.into();
        self
    }

    #[inline]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.desc.description = description.into();
        self
    }

    #[inline]
    pub fn subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.desc.subject_prefix = prefix.into();
        self
    }

    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.desc.timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.desc.metadata.insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn declare_error(mut self, code: impl Into<String>) -> Self {
        self.desc.errors.insert(code.into());
        self
    }

    #[inline]
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.desc.encoding = encoding;
        self
    }

    #[inline]
    pub fn endpoint(mut self, ep: EndpointDescriptor) -> Self {
        self.desc.endpoints.push(ep);
        self
    }

    pub fn build(self) -> Result<ServiceDescriptor, ConfigError> {
        self.desc.validate()?;
        Ok(self.desc)
    }
}
