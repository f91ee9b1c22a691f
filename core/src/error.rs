//! Error taxonomy shared by every micro-rpc crate.
//!
//! - [ErrorEnvelope]: the structured error a server replies with (code, message, optional data).
//! - [RpcIntErr]: conditions produced by the runtime itself, never by a server handler.
//! - [RpcError]: what a client-side call returns.
//! - [ToEnvelope]: the capability a handler error exposes to pick its code.

use crate::header::{DESCRIPTION, Headers, NO_RESPONDERS_STATUS, STATUS};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

pub const RPC_ERR_PREFIX: &'static str = "rpc_";

/// The closed set of built-in envelope codes.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::IntoStaticStr,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Hash,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    Internal,
    Unavailable,
}

impl Code {
    pub const ALL: [Code; 7] = [
        Code::InvalidArgument,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::Unauthenticated,
        Code::Internal,
        Code::Unavailable,
    ];

    #[inline(always)]
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    #[inline]
    pub fn is_builtin(code: &str) -> bool {
        Code::from_str(code).is_ok()
    }
}

/// Structured error carried back to the caller.
///
/// On the wire the code travels in the `Status` header, the message in `Description`,
/// and `data` (if any) as the message body.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub data: Option<Bytes>,
}

impl fmt::Debug for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.data {
            Some(d) => write!(f, "{}: {} ({} bytes data)", self.code, self.message, d.len()),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

macro_rules! builtin_ctor {
    ($name: ident, $code: expr) => {
        #[inline]
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new($code, message)
        }
    };
}

impl ErrorEnvelope {
    #[inline]
    pub fn new(code: impl AsRef<str>, message: impl Into<String>) -> Self {
        Self { code: code.as_ref().to_string(), message: message.into(), data: None }
    }

    builtin_ctor!(invalid_argument, Code::InvalidArgument);
    builtin_ctor!(not_found, Code::NotFound);
    builtin_ctor!(already_exists, Code::AlreadyExists);
    builtin_ctor!(permission_denied, Code::PermissionDenied);
    builtin_ctor!(unauthenticated, Code::Unauthenticated);
    builtin_ctor!(internal, Code::Internal);
    builtin_ctor!(unavailable, Code::Unavailable);

    #[inline]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Plain string equality against the code, so unknown custom codes still compare.
    #[inline(always)]
    pub fn is(&self, code: impl AsRef<str>) -> bool {
        self.code == code.as_ref()
    }

    #[inline]
    pub fn is_builtin(&self) -> bool {
        Code::is_builtin(&self.code)
    }

    /// Write the status fields into `headers`, returning the body to send.
    pub fn encode(&self, headers: &mut Headers) -> Bytes {
        headers.insert(STATUS, self.code.clone());
        headers.insert(DESCRIPTION, self.message.clone());
        match &self.data {
            Some(d) => d.clone(),
            None => Bytes::new(),
        }
    }

    /// Returns None when the headers carry no status, i.e. the message is a normal reply.
    ///
    /// The bus-level no-responders status is mapped to `UNAVAILABLE`.
    pub fn decode(headers: &Headers, body: &Bytes) -> Option<Self> {
        let code = headers.get(STATUS)?;
        if code.is_empty() {
            return None;
        }
        if code == NO_RESPONDERS_STATUS {
            return Some(Self::unavailable("no responders available for request"));
        }
        let message = headers.get(DESCRIPTION).unwrap_or("").to_string();
        let data = if body.is_empty() { None } else { Some(body.clone()) };
        Some(Self { code: code.to_string(), message, data })
    }
}

/// The capability a handler error exposes to choose its envelope.
///
/// Every provided method falls back to `INTERNAL`, so an error type that only implements
/// `Display` still converts.
pub trait ToEnvelope: fmt::Display {
    fn code(&self) -> Option<&str> {
        None
    }

    fn message(&self) -> String {
        self.to_string()
    }

    fn data(&self) -> Option<Bytes> {
        None
    }

    fn to_envelope(&self) -> ErrorEnvelope {
        match self.code() {
            Some(code) if !code.is_empty() => {
                ErrorEnvelope { code: code.to_string(), message: self.message(), data: self.data() }
            }
            _ => ErrorEnvelope::internal(self.message()),
        }
    }
}

impl ToEnvelope for ErrorEnvelope {
    #[inline]
    fn code(&self) -> Option<&str> {
        Some(&self.code)
    }

    #[inline]
    fn message(&self) -> String {
        self.message.clone()
    }

    #[inline]
    fn data(&self) -> Option<Bytes> {
        self.data.clone()
    }
}

impl ToEnvelope for RpcError {
    #[inline]
    fn code(&self) -> Option<&str> {
        match self {
            Self::Status(e) => Some(&e.code),
            Self::Rpc(_) => None,
        }
    }

    #[inline]
    fn message(&self) -> String {
        match self {
            Self::Status(e) => e.message.clone(),
            Self::Rpc(e) => e.to_string(),
        }
    }

    #[inline]
    fn data(&self) -> Option<Bytes> {
        match self {
            Self::Status(e) => e.data.clone(),
            Self::Rpc(_) => None,
        }
    }
}

impl ToEnvelope for anyhow::Error {
    #[inline]
    fn code(&self) -> Option<&str> {
        self.downcast_ref::<ErrorEnvelope>().map(|e| e.code.as_str())
    }

    #[inline]
    fn message(&self) -> String {
        match self.downcast_ref::<ErrorEnvelope>() {
            Some(e) => e.message.clone(),
            None => format!("{:#}", self),
        }
    }

    #[inline]
    fn data(&self) -> Option<Bytes> {
        self.downcast_ref::<ErrorEnvelope>().and_then(|e| e.data.clone())
    }
}

impl ToEnvelope for std::io::Error {}

impl ToEnvelope for String {}

impl ToEnvelope for &'static str {}

/// "rpc_" prefix is reserved for runtime errors
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    PartialOrd,
    Clone,
    Copy,
    thiserror::Error,
)]
#[repr(u8)]
pub enum RpcIntErr {
    /// The caller's deadline expired before a reply arrived
    #[strum(serialize = "rpc_timeout")]
    Timeout = 0,
    /// The call context was cancelled
    #[strum(serialize = "rpc_cancelled")]
    Cancelled = 1,
    /// IO error from the transport
    #[strum(serialize = "rpc_io_err")]
    IO = 2,
    /// Connection or subscription is closed
    #[strum(serialize = "rpc_closed")]
    Closed = 3,
    /// Encode Error
    #[strum(serialize = "rpc_encode")]
    Encode = 4,
    /// Decode Error
    #[strum(serialize = "rpc_decode")]
    Decode = 5,
    /// A stream message arrived with a sequence number past the next expected one
    #[strum(serialize = "rpc_stream_gap")]
    StreamGap = 6,
    /// Operation not allowed in the current session state
    #[strum(serialize = "rpc_invalid_state")]
    InvalidState = 7,
}

// The default Debug derive just ignore strum customized string
impl fmt::Debug for RpcIntErr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::io::Error> for RpcIntErr {
    #[inline(always)]
    fn from(_e: std::io::Error) -> Self {
        Self::IO
    }
}

/// The error returned by client calls.
#[derive(thiserror::Error, Clone, PartialEq)]
pub enum RpcError {
    /// Reported by the server, or `UNAVAILABLE` mapped from a transport failure
    #[error("{0}")]
    Status(ErrorEnvelope),
    /// Raised locally by the runtime (timeout, cancellation, codec)
    #[error("{0}")]
    Rpc(RpcIntErr),
}

impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Status(e) => fmt::Debug::fmt(e, f),
            Self::Rpc(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl RpcError {
    #[inline]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Status(ErrorEnvelope::unavailable(message))
    }

    #[inline]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Status(e) => Some(&e.code),
            Self::Rpc(_) => None,
        }
    }

    /// True when the server (or the transport mapping) reported exactly this code.
    ///
    /// Runtime errors never match any code.
    #[inline]
    pub fn is(&self, code: impl AsRef<str>) -> bool {
        match self {
            Self::Status(e) => e.is(code),
            Self::Rpc(_) => false,
        }
    }

    #[inline]
    pub fn envelope(&self) -> Option<&ErrorEnvelope> {
        match self {
            Self::Status(e) => Some(e),
            Self::Rpc(_) => None,
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        *self == RpcIntErr::Timeout
    }
}

impl std::cmp::PartialEq<RpcIntErr> for RpcError {
    #[inline]
    fn eq(&self, other: &RpcIntErr) -> bool {
        if let Self::Rpc(r) = self {
            return r == other;
        }
        false
    }
}

impl From<ErrorEnvelope> for RpcError {
    #[inline]
    fn from(e: ErrorEnvelope) -> Self {
        Self::Status(e)
    }
}

impl From<RpcIntErr> for RpcError {
    #[inline]
    fn from(e: RpcIntErr) -> Self {
        Self::Rpc(e)
    }
}

/// Raised while wiring services and clients together, before any traffic flows.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "key template {template:?} references field {{{field}}} which does not exist on request message {message} (available fields: [{available}])"
    )]
    UnknownKeyField { template: String, field: String, message: String, available: String },
    #[error("key template {template:?} is malformed: {reason}")]
    InvalidKeyTemplate { template: String, reason: String },
    #[error("request message {0} is not a struct with named fields")]
    NoRequestSchema(String),
    #[error("service {service} has no endpoint {method}")]
    UnknownEndpoint { service: String, method: String },
    #[error("endpoint {service}.{method} is declared {declared} but registered as {registered}")]
    ShapeMismatch { service: String, method: String, declared: String, registered: String },
    #[error("endpoint {service}.{method} has no handler")]
    MissingHandler { service: String, method: String },
    #[error("endpoint {service}.{method} has more than one handler")]
    DuplicateHandler { service: String, method: String },
    #[error("service {service} declares endpoint {method} twice")]
    DuplicateEndpoint { service: String, method: String },
    #[error("endpoint {service}.{method} is {shape}, persistence only applies to unary endpoints")]
    UnsupportedPersistence { service: String, method: String, shape: String },
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("custom error code {0:?} collides with a built-in code")]
    ReservedCode(String),
    #[error("transport refused subscription on {subject}: {err}")]
    Subscribe { subject: String, err: RpcIntErr },
}

/// Failure inside a key-value or blob store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("bucket {0} not found")]
    BucketNotFound(String),
    #[error("object {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}
