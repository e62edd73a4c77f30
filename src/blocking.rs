//! Blocking frontend.
//!
//! Drives the async engine on a private current-thread runtime, the way
//! `reqwest::blocking` does. Every decision the retry loop makes is shared
//! with the async session; only the suspension points block instead of
//! yielding.

use std::collections::HashMap;
use std::time::Duration;

use http::Method;
use tokio::runtime::Runtime;

use crate::errors::{WaferError, WaferResult};
use crate::response::WaferResponse;
use crate::session::{RequestParts, SessionBuilder};
use crate::transport::RequestBody;

/// Anti-detection HTTP session (blocking).
pub struct Session {
    session: crate::Session,
    runtime: Runtime,
}

impl Session {
    /// Construct a blocking session with default configuration.
    pub fn new() -> WaferResult<Self> {
        SessionBuilder::new().build_blocking()
    }

    /// Builder shared with the async session; finish with
    /// [`SessionBuilder::build_blocking`].
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Builder preset for bulk scraping.
    pub fn bulk() -> SessionBuilder {
        SessionBuilder::new().bulk()
    }

    pub(crate) fn from_async(session: crate::Session) -> WaferResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| WaferError::Setup(format!("runtime: {err}")))?;
        Ok(Self { session, runtime })
    }

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

    /// Inject a raw Set-Cookie line into the session's cookie jar.
    pub fn add_cookie(&self, raw_set_cookie: &str, url: &str) -> WaferResult<()> {
        self.runtime
            .block_on(self.session.add_cookie(raw_set_cookie, url))
    }

    /// Release held resources (the browser solver's headless process).
    pub fn close(&self) {
        self.session.close();
    }
}

/// Builder for one request on a blocking [`Session`].
pub struct RequestBuilder<'a> {
    session: &'a Session,
    parts: RequestParts,
}

impl<'a> RequestBuilder<'a> {
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

    pub fn query(mut self, params: &[(&str, &str)]) -> Self {
        self.parts.query(params);
        self
    }

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

    /// Run the request to completion, blocking the current thread.
    pub fn send(self) -> WaferResult<WaferResponse> {
        self.session
            .runtime
            .block_on(self.session.session.execute(self.parts))
    }
}
