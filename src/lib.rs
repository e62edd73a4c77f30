//! # wafer
//!
//! An anti-detection HTTP client. Callers issue ordinary request/response
//! calls and the session transparently defeats WAF defenses that reject
//! generic automated clients: browser TLS identities with matched Client
//! Hints, challenge classification for 14+ WAF families, fingerprint
//! rotation under pressure, per-domain rate limiting, persistent cookie
//! warming, inline solvers for transform-only challenges, and an optional
//! headless-browser escalation for JS-only challenges.
//!
//! ## Example
//!
//! ```no_run
//! use wafer::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new()?;
//!     let response = session.get("https://example.com").send().await?;
//!     println!("{}", response.text());
//!     Ok(())
//! }
//! ```
//!
//! A blocking variant driving the same state machine lives in
//! [`blocking`].

mod errors;
mod response;
mod retry;
mod session;

pub mod blocking;
pub mod browser;
pub mod challenge;
pub mod cookies;
pub mod fingerprint;
pub mod kasada;
pub mod ratelimit;
pub mod solvers;
pub mod transport;

pub use crate::challenge::{ChallengeType, classify};

pub use crate::cookies::{CookieCache, CookieEntry, extract_domain};

pub use crate::errors::{WaferError, WaferResult};

pub use crate::fingerprint::{
    FingerprintManager,
    chrome_version_from_ua,
    generate_sec_ch_ua,
    generate_sec_ch_ua_full_version_list,
};

pub use crate::kasada::{KasadaSession, KasadaStore, generate_cd};

pub use crate::ratelimit::RateLimiter;

pub use crate::response::WaferResponse;

pub use crate::session::{
    EmbedMode,
    RequestBuilder,
    Session,
    SessionBuilder,
    SessionConfig,
    default_headers,
};

pub use crate::transport::{
    Emulation,
    RequestBody,
    ReqwestTransport,
    ReqwestTransportFactory,
    Transport,
    TransportConfig,
    TransportError,
    TransportFactory,
    TransportRequest,
    TransportResponse,
};

pub use crate::browser::{
    BrowserCookie,
    BrowserSolution,
    BrowserSolver,
    KasadaTokens,
    PassthroughResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
