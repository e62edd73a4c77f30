//! Transport contract: the TLS-capable HTTP client behind the retry engine.
//!
//! The engine never talks to the network directly. It hands a fully built
//! request (method, URL, header delta, body, per-attempt timeout) to a
//! [`Transport`] and receives the raw response back. A [`TransportFactory`]
//! discovers the available emulation profiles and builds fresh transports;
//! rebuilding discards the connection pool, TLS session tickets, and the
//! in-memory cookie jar, which is exactly what identity rotation needs.

mod reqwest_client;

pub use reqwest_client::{ReqwestTransport, ReqwestTransportFactory};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;

/// Opaque identifier for a browser TLS+HTTP/2 fingerprint.
///
/// The transport maps it to a concrete ClientHello, ALPN list, H2 SETTINGS,
/// and header ordering. The core uses profiles by reference only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emulation {
    Chrome(u16),
    Safari(u16),
}

impl Emulation {
    /// Chrome major version, or `None` for non-Chrome profiles.
    pub fn chrome_version(&self) -> Option<u16> {
        match self {
            Emulation::Chrome(v) => Some(*v),
            Emulation::Safari(_) => None,
        }
    }

    pub fn is_chrome(&self) -> bool {
        matches!(self, Emulation::Chrome(_))
    }

    pub fn is_safari(&self) -> bool {
        matches!(self, Emulation::Safari(_))
    }
}

impl fmt::Display for Emulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Emulation::Chrome(v) => write!(f, "Chrome{v}"),
            Emulation::Safari(v) => write!(f, "Safari{v}"),
        }
    }
}

/// Request body forms accepted by [`Transport::execute`].
#[derive(Debug, Clone)]
pub enum RequestBody {
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// One fully built request handed to the transport.
///
/// `headers` holds only the delta relative to the client-level header set
/// baked in at construction — sending the full set again would duplicate
/// headers at the HTTP/2 frame level, which strict WAFs detect.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Per-attempt timeout, already clamped to the remaining deadline.
    pub timeout: Option<Duration>,
}

/// Raw response handed back to the engine. Redirects are never followed by
/// the transport; content decoding (gzip/br/zstd) already happened.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub url: Url,
    pub body: Bytes,
}

/// Transport-layer failures. All variants are retryable from the engine's
/// point of view (they consume the normal-retry budget).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("body decode: {0}")]
    Decode(String),
    #[error("invalid header: {0}")]
    Header(String),
    #[error("{0}")]
    Other(String),
}

/// Configuration a factory needs to build one transport instance.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub emulation: Emulation,
    /// Client-level header set: session defaults merged with the current
    /// profile's client-hint headers.
    pub headers: HashMap<String, String>,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

/// A browser-identity HTTP client with a cookie jar.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Inject a raw Set-Cookie line into the jar for the given URL.
    fn add_cookie(&self, raw_set_cookie: &str, url: &Url) -> Result<(), TransportError>;
}

/// Builds transports and advertises the emulation profiles it supports.
pub trait TransportFactory: Send + Sync {
    /// Profiles this transport can emulate. Order is not significant; the
    /// fingerprint manager sorts Chrome profiles newest-first itself.
    fn emulations(&self) -> Vec<Emulation>;

    fn build(&self, config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulation_display_and_version() {
        assert_eq!(Emulation::Chrome(145).to_string(), "Chrome145");
        assert_eq!(Emulation::Safari(18).to_string(), "Safari18");
        assert_eq!(Emulation::Chrome(133).chrome_version(), Some(133));
        assert_eq!(Emulation::Safari(18).chrome_version(), None);
    }
}
