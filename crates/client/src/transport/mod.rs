//! Transport seam between the pool and the wire
//!
//! The pool owns connection lifecycle and limits; a [`Transport`] only knows
//! how to open a logical connection to an [`Endpoint`], send one request on
//! it, and close it. [`http::HttpTransport`] is the reqwest-backed
//! implementation.

pub mod http;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use synclink_common::error::CommonError;
use url::Url;

pub use self::http::HttpTransport;
use crate::error::NetResult;

/// Wire protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Https,
    #[serde(rename = "ws")]
    WebSocket,
    #[serde(rename = "wss")]
    SecureWebSocket,
}

impl TransportKind {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ws" => Some(Self::WebSocket),
            "wss" => Some(Self::SecureWebSocket),
            _ => None,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::WebSocket => "ws",
            Self::SecureWebSocket => "wss",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Self::Https | Self::SecureWebSocket)
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, Self::WebSocket | Self::SecureWebSocket)
    }
}

/// Scheme, host and port of a remote service; the pooling key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    kind: TransportKind,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse the origin of `url`; path and query are ignored
    pub fn parse(url: &str) -> NetResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| CommonError::validation("url", format!("invalid url '{url}': {e}")))?;
        Self::from_url(&parsed)
    }

    pub fn from_url(url: &Url) -> NetResult<Self> {
        let kind = TransportKind::from_scheme(url.scheme()).ok_or_else(|| {
            CommonError::validation("url", format!("unsupported scheme '{}'", url.scheme()))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| CommonError::validation("url", format!("'{url}' has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| CommonError::validation("url", format!("'{url}' has no port")))?;
        Ok(Self { kind, host: host.to_ascii_lowercase(), port })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, the key for per-host limits
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind.scheme(), self.host, self.port)
    }
}

/// HTTP method of a logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Safe reads that may be coalesced
    pub fn is_idempotent_read(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Raw { bytes: Vec<u8>, content_type: String, content_encoding: Option<String> },
}

/// Per-request options accepted by the pool and the batcher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    /// Per-request transport timeout
    pub timeout: Option<Duration>,
    /// Batch priority; `None` means the middle level
    pub priority: Option<usize>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn new(method: Method) -> Self {
        Self { method, ..Self::default() }
    }

    pub fn post_json(body: Value) -> Self {
        Self { method: Method::Post, body: Some(RequestBody::Json(body)), ..Self::default() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: usize) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A request bound for a concrete URL
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub options: RequestOptions,
}

/// Response delivered to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Opaque per-connection transport state
#[derive(Clone)]
pub struct TransportHandle(Arc<dyn Any + Send + Sync>);

impl TransportHandle {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportHandle(..)")
    }
}

/// Opens, uses and closes logical connections
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection; must give up after `timeout`
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> NetResult<TransportHandle>;

    /// Send one request over an established connection
    ///
    /// Non-2xx answers are reported as `NetError::Transport` carrying the
    /// status.
    async fn send(&self, handle: &TransportHandle, request: &OutboundRequest)
        -> NetResult<Response>;

    async fn close(&self, handle: &TransportHandle) -> NetResult<()>;
}
