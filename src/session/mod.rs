//! Session orchestration: configuration, builder, and the public request
//! API.
//!
//! A session owns one transport (browser identity), a fingerprint manager,
//! an optional cookie cache and rate limiter, and the per-domain health and
//! referer bookkeeping. A session instance is not thread-safe in spirit —
//! run one instance per task; concurrent calls on the same instance simply
//! serialize.

mod engine;
mod headers;
mod redirect;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::sync::Mutex;
use url::Url;

use crate::browser::BrowserSolver;
use crate::cookies::{CookieCache, extract_domain};
use crate::errors::{WaferError, WaferResult};
use crate::fingerprint::FingerprintManager;
use crate::kasada::KasadaStore;
use crate::ratelimit::RateLimiter;
use crate::response::WaferResponse;
use crate::transport::{
    Emulation, RequestBody, ReqwestTransportFactory, Transport, TransportFactory,
};

pub(crate) const DEFAULT_CACHE_DIR: &str = "./data/wafer/cookies";

/// Browser-consistent defaults sent at the client level on every request.
pub fn default_headers() -> HashMap<String, String> {
    HashMap::from([
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,\
             image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7"
                .to_string(),
        ),
        ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
        (
            "Accept-Encoding".to_string(),
            "gzip, deflate, br, zstd".to_string(),
        ),
        ("Cache-Control".to_string(), "max-age=0".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
    ])
}

/// Embed impersonation modes for cross-site resource fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    /// Simulate an in-page `fetch()` of a cross-site resource.
    Xhr,
    /// Simulate an iframe navigation.
    Iframe,
}

/// Session configuration consumed by [`SessionBuilder`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial emulation profile; defaults to the newest Chrome the
    /// transport advertises.
    pub emulation: Option<Emulation>,
    /// Session default header set (client level).
    pub headers: HashMap<String, String>,
    pub connect_timeout: Duration,
    /// Per-attempt transport deadline and the default overall budget.
    pub timeout: Duration,
    /// Normal-retry budget (5xx, transport errors, empty bodies).
    pub max_retries: u32,
    /// Rotation budget (403/429/challenges).
    pub max_rotations: u32,
    /// Cookie cache directory; `None` disables disk persistence.
    pub cache_dir: Option<PathBuf>,
    /// Consecutive-failure threshold for session retirement; `None`
    /// disables retirement (bulk mode).
    pub max_failures: Option<u32>,
    /// Minimum seconds between requests to the same domain (0 disables).
    pub rate_limit: f64,
    /// Additional uniform-random delay on top of `rate_limit`.
    pub rate_jitter: f64,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub embed: Option<EmbedMode>,
    pub embed_origin: Option<String>,
    pub embed_referers: Vec<String>,
    pub proxy: Option<String>,
    /// Rebuild the transport after every N requests for unlinkable
    /// request sequences.
    pub rotate_every: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            emulation: None,
            headers: default_headers(),
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            max_rotations: 10,
            cache_dir: Some(PathBuf::from(DEFAULT_CACHE_DIR)),
            max_failures: Some(3),
            rate_limit: 0.0,
            rate_jitter: 0.0,
            follow_redirects: true,
            max_redirects: 10,
            embed: None,
            embed_origin: None,
            embed_referers: Vec::new(),
            proxy: None,
            rotate_every: None,
        }
    }
}

/// Fluent builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    browser_solver: Option<Arc<dyn BrowserSolver>>,
    kasada_store: Option<KasadaStore>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            transport_factory: None,
            browser_solver: None,
            kasada_store: None,
        }
    }

    /// Presets tuned for high-volume bulk scraping: one normal retry, no
    /// rotation, no retirement, no cookie disk cache. The engine returns
    /// challenged responses instead of raising.
    pub fn bulk(mut self) -> Self {
        self.config.max_retries = 1;
        self.config.max_rotations = 0;
        self.config.max_failures = None;
        self.config.cache_dir = None;
        self
    }

    pub fn emulation(mut self, emulation: Emulation) -> Self {
        self.config.emulation = Some(emulation);
        self
    }

    /// Replace the session default header set.
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.config.headers = headers;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn max_rotations(mut self, max_rotations: u32) -> Self {
        self.config.max_rotations = max_rotations;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn disable_cookie_cache(mut self) -> Self {
        self.config.cache_dir = None;
        self
    }

    pub fn max_failures(mut self, max_failures: impl Into<Option<u32>>) -> Self {
        self.config.max_failures = max_failures.into();
        self
    }

    /// Per-domain rate limiting: minimum interval plus uniform jitter.
    pub fn rate_limit(mut self, min_interval: f64, jitter: f64) -> Self {
        self.config.rate_limit = min_interval;
        self.config.rate_jitter = jitter;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn max_redirects(mut self, max_redirects: u32) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    /// Enables `xhr` embed mode unless `embed(EmbedMode::Iframe)` is also
    /// set.
    pub fn embed_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.embed_origin = Some(origin.into());
        self
    }

    pub fn embed_referers<I, S>(mut self, referers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.embed_referers = referers.into_iter().map(Into::into).collect();
        self
    }

    pub fn embed(mut self, mode: EmbedMode) -> Self {
        self.config.embed = Some(mode);
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy = Some(proxy.into());
        self
    }

    pub fn rotate_every(mut self, requests: u64) -> Self {
        self.config.rotate_every = Some(requests);
        self
    }

    pub fn browser_solver(mut self, solver: Arc<dyn BrowserSolver>) -> Self {
        self.browser_solver = Some(solver);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Inject a shared Kasada CT/ST store for cross-session reuse.
    pub fn kasada_store(mut self, store: KasadaStore) -> Self {
        self.kasada_store = Some(store);
        self
    }

    pub fn build(self) -> WaferResult<Session> {
        Session::with_parts(
            self.config,
            self.transport_factory
                .unwrap_or_else(|| Arc::new(ReqwestTransportFactory::new())),
            self.browser_solver,
            self.kasada_store.unwrap_or_default(),
        )
    }

    /// Build a [`crate::blocking::Session`] driving the same engine.
    pub fn build_blocking(self) -> WaferResult<crate::blocking::Session> {
        crate::blocking::Session::from_async(self.build()?)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct SessionInner {
    pub transport: Arc<dyn Transport>,
    pub fingerprint: FingerprintManager,
    /// Set while the Safari alternate identity is active.
    pub safari_override: Option<Emulation>,
    pub tried_safari: bool,
    /// Consecutive 403/429 failures per domain.
    pub domain_failures: HashMap<String, u32>,
    /// Last URL fetched per domain, for the referer chain.
    pub last_url: HashMap<String, String>,
    pub request_count: u64,
}

/// Anti-detection HTTP session (async).
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) cookie_cache: Option<CookieCache>,
    pub(crate) rate_limiter: Option<RateLimiter>,
    pub(crate) browser_solver: Option<Arc<dyn BrowserSolver>>,
    pub(crate) kasada: KasadaStore,
    pub(crate) inner: Mutex<SessionInner>,
}

impl Session {
    /// Construct a session with default configuration.
    pub fn new() -> WaferResult<Self> {
        SessionBuilder::new().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Builder preset for bulk scraping (see [`SessionBuilder::bulk`]).
    pub fn bulk() -> SessionBuilder {
        SessionBuilder::new().bulk()
    }

    fn with_parts(
        mut config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        browser_solver: Option<Arc<dyn BrowserSolver>>,
        kasada: KasadaStore,
    ) -> WaferResult<Self> {
        // embed_origin without an explicit mode means xhr
        if config.embed_origin.is_some() && config.embed.is_none() {
            config.embed = Some(EmbedMode::Xhr);
        }

        let fingerprint = FingerprintManager::new(&factory.emulations(), config.emulation);
        let cookie_cache = config.cache_dir.clone().map(CookieCache::new);
        let rate_limiter = (config.rate_limit > 0.0)
            .then(|| RateLimiter::new(config.rate_limit, config.rate_jitter));

        let session = Self {
            config,
            factory,
            cookie_cache,
            rate_limiter,
            browser_solver,
            kasada,
            inner: Mutex::new(SessionInner {
                // replaced by rebuild_transport before the constructor returns
                transport: Arc::new(NullTransport),
                fingerprint,
                safari_override: None,
                tried_safari: false,
                domain_failures: HashMap::new(),
                last_url: HashMap::new(),
                request_count: 0,
            }),
        };

        {
            let mut inner = session
                .inner
                .try_lock()
                .expect("fresh session mutex is uncontended");
            session.rebuild_transport(&mut inner)?;
        }

        if let Some(ref origin) = session.config.embed_origin {
            log::info!(
                "Session created in embed mode: origin={origin}, referers={}",
                session.config.embed_referers.len()
            );
        } else {
            log::debug!(
                "Session created with timeout={:?}",
                session.config.timeout
            );
        }

        Ok(session)
    }

    /// Start building a request with an arbitrary method.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder {
            session: self,
            parts: RequestParts::new(method, url.into()),
        }
    }

    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::HEAD, url)
    }

    pub fn options(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::OPTIONS, url)
    }

    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, url)
    }

    /// Inject a raw Set-Cookie line into the session's cookie jar, and into
    /// the disk cache when caching is enabled.
    pub async fn add_cookie(&self, raw_set_cookie: &str, url: &str) -> WaferResult<()> {
        let parsed = Url::parse(url)?;
        let inner = self.inner.lock().await;
        inner
            .transport
            .add_cookie(raw_set_cookie, &parsed)
            .map_err(|err| WaferError::Setup(format!("cookie rejected: {err}")))?;
        if let Some(ref cache) = self.cookie_cache {
            if let Some(domain) = extract_domain(url) {
                cache.save_from_headers(&domain, &[raw_set_cookie.to_string()], url);
            }
        }
        Ok(())
    }

    /// The emulation profile currently in effect.
    pub async fn emulation(&self) -> Emulation {
        let inner = self.inner.lock().await;
        engine::effective_emulation(&inner)
    }

    /// Whether the fingerprint is pinned (set after a rotated request
    /// succeeds).
    pub async fn fingerprint_pinned(&self) -> bool {
        self.inner.lock().await.fingerprint.pinned()
    }

    /// Release held resources (the browser solver's headless process).
    pub fn close(&self) {
        if let Some(ref solver) = self.browser_solver {
            solver.close();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Placeholder transport used only during construction, before the first
/// [`Session::rebuild_transport`].
struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    async fn execute(
        &self,
        _request: crate::transport::TransportRequest,
    ) -> Result<crate::transport::TransportResponse, crate::transport::TransportError> {
        Err(crate::transport::TransportError::Other(
            "transport not initialized".into(),
        ))
    }

    fn add_cookie(
        &self,
        _raw: &str,
        _url: &Url,
    ) -> Result<(), crate::transport::TransportError> {
        Err(crate::transport::TransportError::Other(
            "transport not initialized".into(),
        ))
    }
}

/// Request data shared by the async and blocking builders.
#[derive(Debug, Clone)]
pub(crate) struct RequestParts {
    pub method: Method,
    pub url: String,
    pub headers: Option<HashMap<String, String>>,
    pub params: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub body: Option<RequestBody>,
}

impl RequestParts {
    pub(crate) fn new(method: Method, url: String) -> Self {
        Self {
            method,
            url,
            headers: None,
            params: Vec::new(),
            timeout: None,
            body: None,
        }
    }

    pub(crate) fn header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
    }

    pub(crate) fn query(&mut self, params: &[(&str, &str)]) {
        self.params.extend(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
    }
}

/// Builder for one request on an async [`Session`].
pub struct RequestBuilder<'a> {
    session: &'a Session,
    parts: RequestParts,
}

impl<'a> RequestBuilder<'a> {
    /// Per-request header override. An empty value suppresses the header
    /// entirely, including client-level defaults.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.header(name, value);
        self
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        for (name, value) in headers {
            self.parts.header(name, value);
        }
        self
    }

    /// Append query parameters, preserving any already in the URL.
    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.parts.query(params);
        self
    }

    /// Overall deadline for this request, bounding the whole retry loop.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.parts.timeout = Some(timeout);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.parts.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.parts.body = Some(RequestBody::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self
    }

    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => self.parts.body = Some(RequestBody::Json(json)),
            Err(err) => log::warn!("Failed to serialize JSON body: {err}"),
        }
        self
    }

    pub async fn send(self) -> WaferResult<WaferResponse> {
        self.session.execute(self.parts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_headers_are_browser_consistent() {
        let headers = default_headers();
        assert!(headers["Accept"].contains("text/html"));
        assert!(headers["Accept-Encoding"].contains("zstd"));
        assert_eq!(headers["Upgrade-Insecure-Requests"], "1");
    }

    #[test]
    fn bulk_preset_disables_rotation_and_retirement() {
        let builder = SessionBuilder::new().bulk();
        assert_eq!(builder.config.max_retries, 1);
        assert_eq!(builder.config.max_rotations, 0);
        assert_eq!(builder.config.max_failures, None);
        assert!(builder.config.cache_dir.is_none());
    }

    #[test]
    fn request_parts_accumulate() {
        let mut parts = RequestParts::new(Method::GET, "https://example.com/".into());
        parts.header("X-One", "1");
        parts.query(&[("a", "b")]);
        assert_eq!(parts.headers.as_ref().unwrap()["X-One"], "1");
        assert_eq!(parts.params, vec![("a".to_string(), "b".to_string())]);
    }
}
