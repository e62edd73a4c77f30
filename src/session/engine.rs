//! The per-request state machine: rate-limit wait → send → classify →
//! {inline-solve | rotate | retry | backoff | browser-solve | redirect |
//! return | fail}, under two independent budgets.
//!
//! Async and blocking frontends share this loop unchanged; the only
//! suspension points are the rate-limit wait, the transport send, the
//! inter-retry sleeps, and the browser solver.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};
use tokio::time::Instant;
use url::Url;

use crate::challenge::{self, ChallengeType};
use crate::cookies::{CookieEntry, now_epoch};
use crate::errors::{WaferError, WaferResult};
use crate::fingerprint::chrome_version_from_ua;
use crate::response::WaferResponse;
use crate::retry::{RetryState, backoff, calculate_backoff, parse_retry_after};
use crate::session::headers::build_header_delta;
use crate::session::redirect::{is_cross_origin, resolve_redirect, strip_sensitive_headers};
use crate::session::{RequestParts, Session, SessionInner};
use crate::solvers::{parse_amazon_captcha, solve_acw, tmd_homepage_url};
use crate::transport::{Emulation, RequestBody, TransportConfig, TransportRequest};

const BINARY_CONTENT_PREFIXES: &[&str] = &[
    "image/",
    "audio/",
    "video/",
    "font/",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-gzip",
    "application/octet-stream",
    "application/wasm",
    "application/x-tar",
    "application/x-7z-compressed",
    "application/vnd.",
];

/// Binary responses skip challenge detection and text decoding. WAF
/// challenges always return text/html, so this is safe. Unknown or missing
/// content types are treated as text (conservative).
fn is_binary_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    !ct.is_empty() && BINARY_CONTENT_PREFIXES.iter().any(|p| ct.starts_with(p))
}

/// Only HTML responses go through challenge classification. API endpoints
/// (JSON/XML) may carry challenge markers in cookies or headers, but
/// browser-solving the API URL itself cannot work — it renders raw JSON.
fn is_challengeable_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.is_empty() || ct.starts_with("text/html") || ct.starts_with("application/xhtml")
}

/// Decode a raw header map to a lowercase string map. Multi-value headers
/// (especially Set-Cookie) are joined with `"; "` so nothing is dropped.
pub(crate) fn decode_headers(map: &HeaderMap) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for key in map.keys() {
        let values: Vec<String> = map
            .get_all(key)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        result.insert(key.as_str().to_ascii_lowercase(), values.join("; "));
    }
    result
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or(url.as_str()).to_string()
}

/// The emulation profile the transport is (or will be) built with.
pub(crate) fn effective_emulation(inner: &SessionInner) -> Emulation {
    inner
        .safari_override
        .unwrap_or_else(|| inner.fingerprint.current())
}

/// Minimum sleep between rotations, growing with consecutive rotations to
/// avoid hammering a WAF that just flagged us.
fn rotation_delay(rotation_retries: u32) -> Duration {
    calculate_backoff(rotation_retries.saturating_sub(1), 2.0, 30.0)
}

enum BrowserStep {
    /// The browser received real content; return it, do not re-send.
    Passthrough(WaferResponse),
    /// Cookies injected; retry the original URL over TLS.
    Solved,
    Failed,
}

impl Session {
    /// Run the retry state machine for one request.
    pub(crate) async fn execute(&self, parts: RequestParts) -> WaferResult<WaferResponse> {
        let start = Instant::now();
        let mut inner = self.inner.lock().await;

        let RequestParts {
            mut method,
            url,
            headers: extra_headers,
            params,
            timeout: req_timeout,
            body,
        } = parts;

        let mut current_url = Url::parse(&url)?;
        if !params.is_empty() {
            current_url
                .query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        // A per-request timeout becomes the overall deadline for the whole
        // retry loop; the session timeout only bounds individual attempts.
        let (timeout_secs, deadline) = match req_timeout {
            Some(t) => (t.as_secs_f64(), Some(start + t)),
            None => (self.config.timeout.as_secs_f64(), None),
        };

        let mut state = RetryState::new(self.config.max_retries, self.config.max_rotations);
        let mut extra_headers = extra_headers;
        let mut body = body;
        let mut domain = host_of(&current_url);
        let mut browser_attempted = false;
        let mut redirects_followed = 0u32;

        log::debug!("{method} {current_url}");

        loop {
            if deadline.is_some_and(|d| Instant::now() > d) {
                return Err(WaferError::Timeout {
                    url: url.clone(),
                    timeout_secs,
                });
            }

            if let Some(ref limiter) = self.rate_limiter {
                limiter.wait(&domain).await;
            }

            // TLS session rotation for unlinkable request sequences
            if let Some(every) = self.config.rotate_every {
                inner.request_count += 1;
                if inner.request_count % every == 0 {
                    self.rebuild_transport(&mut inner)?;
                }
            }

            // Rebuild the header delta each iteration: the fingerprint may
            // have rotated and the referer chain may have grown.
            let header_delta = build_header_delta(
                &self.client_headers(&inner),
                &self.config,
                &inner.last_url,
                &self.kasada,
                &current_url,
                extra_headers.as_ref(),
            );

            // Clamp the per-attempt timeout to the remaining deadline so a
            // single slow response cannot overshoot the caller's budget.
            let attempt_timeout = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(WaferError::Timeout {
                            url: url.clone(),
                            timeout_secs,
                        });
                    }
                    Some(remaining.min(self.config.timeout))
                }
                None => None,
            };

            let request = TransportRequest {
                method: method.clone(),
                url: current_url.clone(),
                headers: header_delta,
                body: body.clone(),
                timeout: attempt_timeout,
            };

            let resp = match inner.transport.execute(request).await {
                Ok(resp) => resp,
                Err(err) => {
                    if !state.can_retry() {
                        return Err(WaferError::ConnectionFailed {
                            url: current_url.to_string(),
                            reason: err.to_string(),
                        });
                    }
                    state.use_retry();
                    let delay = backoff(state.normal_retries - 1);
                    log::debug!(
                        "Connection error, retry {}/{} in {:.1}s: {err}",
                        state.normal_retries,
                        state.max_retries,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = resp.status;
            if let Some(ref limiter) = self.rate_limiter {
                limiter.record(&domain);
            }

            // 3xx → follow redirect
            if self.config.follow_redirects && (300..400).contains(&status) && status != 304 {
                let location = resp
                    .headers
                    .get("location")
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
                if let Some(location) = location {
                    if redirects_followed >= self.config.max_redirects {
                        return Err(WaferError::TooManyRedirects {
                            url: current_url.to_string(),
                            max_redirects: self.config.max_redirects,
                        });
                    }
                    let new_url = resolve_redirect(&current_url, &location)?;
                    redirects_followed += 1;
                    log::debug!(
                        "{status} redirect {redirects_followed}/{}: {current_url} -> {new_url}",
                        self.config.max_redirects
                    );
                    // Track referer from the pre-redirect URL
                    record_url(&mut inner, &current_url);
                    let cross_origin = is_cross_origin(&current_url, &new_url);
                    // 301/302/303 rewrite non-GET to GET per fetch spec
                    let mut method_changed = false;
                    if matches!(status, 301 | 302 | 303) && method != Method::GET {
                        method = Method::GET;
                        body = None;
                        method_changed = true;
                    }
                    if (cross_origin || method_changed)
                        && let Some(ref mut extra) = extra_headers
                    {
                        strip_sensitive_headers(extra, method_changed);
                    }
                    current_url = new_url;
                    domain = host_of(&current_url);
                    continue;
                }
            }

            let headers = decode_headers(&resp.headers);
            let was_retried =
                state.normal_retries > 0 || state.rotation_retries > 0 || browser_attempted;

            // Body: raw bytes for binary content, decoded text otherwise
            let content_type = headers.get("content-type").cloned().unwrap_or_default();
            let raw_content = resp.body.clone();
            let body_text: Option<String> = if is_binary_content_type(&content_type) {
                None
            } else {
                Some(String::from_utf8_lossy(&raw_content).into_owned())
            };

            // 5xx → backoff + normal retry
            if (500..600).contains(&status) {
                if !state.can_retry() {
                    return Ok(self.build_response(
                        status,
                        headers,
                        &current_url,
                        start,
                        was_retried,
                        raw_content,
                        body_text,
                        None,
                        &state,
                        Some(resp.headers),
                    ));
                }
                state.use_retry();
                let delay = backoff(state.normal_retries - 1);
                log::debug!(
                    "{status} server error, retry {}/{} in {:.1}s",
                    state.normal_retries,
                    state.max_retries,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            // Challenge detection (HTML responses only — WAF challenges
            // are always HTML pages)
            let challenge = match body_text {
                Some(ref text) if is_challengeable_content_type(&content_type) => {
                    challenge::classify(status, &headers, text)
                }
                _ => None,
            };

            // 429 without a detected challenge → rate-limit rotation
            if status == 429 && challenge.is_none() {
                let retry_after =
                    parse_retry_after(headers.get("retry-after").map_or("", String::as_str));
                if !state.can_rotate() {
                    if self.config.max_rotations == 0 {
                        return Ok(self.build_response(
                            status,
                            headers,
                            &current_url,
                            start,
                            was_retried,
                            raw_content,
                            body_text,
                            None,
                            &state,
                            Some(resp.headers),
                        ));
                    }
                    return Err(WaferError::RateLimited {
                        url: current_url.to_string(),
                        retry_after,
                    });
                }

                // Session health: only retire while budget remains, so the
                // retire path never destroys TLS state right before an
                // exhaustion error.
                let retired = self.record_failure(&mut inner, &domain);
                if retired {
                    self.retire_session(&mut inner, &domain)?;
                }

                state.use_rotation();
                let floor = rotation_delay(state.rotation_retries);
                let delay = retry_after
                    .map(|secs| Duration::from_secs_f64(secs).max(floor))
                    .unwrap_or(floor);
                log::debug!(
                    "429 rate limited, waiting {:.1}s (rotation {}/{})",
                    delay.as_secs_f64(),
                    state.rotation_retries,
                    state.max_rotations
                );
                tokio::time::sleep(delay).await;
                if !retired {
                    self.rotate_identity(&mut inner, &domain, state.rotation_retries)?;
                }
                continue;
            }

            // Challenge or bare 403 → inline solve, browser solve, rotate
            if challenge.is_some() || (status == 403 && body_text.is_some()) {
                // Track the failure now, defer retirement until after the
                // budget check
                let should_retire = self.record_failure(&mut inner, &domain);

                // Inline solver first: no fingerprint rotation, and its own
                // cap — inline solves never consume the rotation budget.
                if let Some(ch) = challenge
                    && ch.is_inline_solvable()
                    && state.inline_solves < state.max_inline_solves
                    && self
                        .try_inline_solve(&mut inner, ch, body_text.as_deref().unwrap_or(""), &current_url)
                        .await
                {
                    state.inline_solves += 1;
                    let delay = calculate_backoff(state.inline_solves - 1, 0.5, 10.0);
                    log::debug!(
                        "{ch} solved inline at {current_url} ({}/{}), retrying in {:.1}s",
                        state.inline_solves,
                        state.max_inline_solves,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                // Early browser solve for JS-only challenges — rotation
                // cannot execute JS
                if let Some(ch) = challenge
                    && ch.is_js_only()
                    && !browser_attempted
                    && self.browser_solver.is_some()
                {
                    browser_attempted = true;
                    match self
                        .try_browser_solve(&mut inner, ch, &current_url, deadline, &state)
                        .await
                    {
                        BrowserStep::Passthrough(mut response) => {
                            self.record_success(&mut inner, &domain);
                            record_url(&mut inner, &current_url);
                            response.elapsed = start.elapsed();
                            return Ok(response);
                        }
                        BrowserStep::Solved => continue,
                        BrowserStep::Failed => {}
                    }
                }

                if !state.can_rotate() {
                    // Last resort: browser solve, once per request
                    if let Some(ch) = challenge
                        && !browser_attempted
                        && self.browser_solver.is_some()
                    {
                        browser_attempted = true;
                        match self
                            .try_browser_solve(&mut inner, ch, &current_url, deadline, &state)
                            .await
                        {
                            BrowserStep::Passthrough(mut response) => {
                                self.record_success(&mut inner, &domain);
                                record_url(&mut inner, &current_url);
                                response.elapsed = start.elapsed();
                                return Ok(response);
                            }
                            BrowserStep::Solved => continue,
                            BrowserStep::Failed => {}
                        }
                    }
                    if let Some(ch) = challenge {
                        if self.config.max_rotations == 0 {
                            return Ok(self.build_response(
                                status,
                                headers,
                                &current_url,
                                start,
                                was_retried,
                                raw_content,
                                body_text,
                                Some(ch),
                                &state,
                                Some(resp.headers),
                            ));
                        }
                        return Err(WaferError::ChallengeDetected {
                            challenge_type: ch,
                            url: current_url.to_string(),
                            status_code: status,
                        });
                    }
                    // Bare 403 at exhaustion: hand the response back
                    return Ok(self.build_response(
                        status,
                        headers,
                        &current_url,
                        start,
                        was_retried,
                        raw_content,
                        body_text,
                        None,
                        &state,
                        Some(resp.headers),
                    ));
                }

                state.use_rotation();
                if should_retire {
                    self.retire_session(&mut inner, &domain)?;
                } else {
                    self.rotate_identity(&mut inner, &domain, state.rotation_retries)?;
                }
                let delay = rotation_delay(state.rotation_retries);
                log::debug!(
                    "{} at {current_url}, rotated (rotation {}/{}), waiting {:.1}s",
                    challenge.map_or("403", |ch| ch.as_str()),
                    state.rotation_retries,
                    state.max_rotations,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            // 200 with an all-whitespace text body → normal retry
            if status == 200 && body_text.as_ref().is_some_and(|t| t.trim().is_empty()) {
                if !state.can_retry() {
                    if self.config.max_retries == 0 {
                        return Ok(self.build_response(
                            status,
                            headers,
                            &current_url,
                            start,
                            was_retried,
                            raw_content,
                            body_text,
                            None,
                            &state,
                            Some(resp.headers),
                        ));
                    }
                    return Err(WaferError::EmptyResponse {
                        url: current_url.to_string(),
                        status_code: status,
                    });
                }
                state.use_retry();
                let delay = backoff(state.normal_retries - 1);
                log::debug!(
                    "Empty 200 body, retry {}/{} in {:.1}s",
                    state.normal_retries,
                    state.max_retries,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            // Success — reset failure counter, pin the fingerprint that
            // earned the cookies, track the referer chain
            self.record_success(&mut inner, &domain);
            record_url(&mut inner, &current_url);
            if state.rotation_retries > 0 {
                inner.fingerprint.pin();
            }

            return Ok(self.build_response(
                status,
                headers,
                &current_url,
                start,
                was_retried,
                raw_content,
                body_text,
                None,
                &state,
                Some(resp.headers),
            ));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_response(
        &self,
        status: u16,
        headers: HashMap<String, String>,
        url: &Url,
        start: Instant,
        was_retried: bool,
        content: Bytes,
        text: Option<String>,
        challenge_type: Option<ChallengeType>,
        state: &RetryState,
        raw: Option<HeaderMap>,
    ) -> WaferResponse {
        WaferResponse::from_parts(
            status,
            headers,
            url.to_string(),
            content,
            text,
            challenge_type,
            was_retried,
            start.elapsed(),
            (
                state.normal_retries,
                state.rotation_retries,
                state.inline_solves,
            ),
            raw,
        )
    }

    /// Client-level header set for the current identity: session defaults
    /// plus client hints (Chrome only).
    pub(crate) fn client_headers(&self, inner: &SessionInner) -> HashMap<String, String> {
        let mut headers = self.config.headers.clone();
        if inner.safari_override.is_none() {
            headers.extend(inner.fingerprint.sec_ch_ua_headers());
        }
        headers
    }

    /// Build a fresh transport for the current identity and rehydrate its
    /// jar from the disk cache. The old client's connection pool, TLS
    /// session tickets, and in-memory cookies are discarded — cookies are
    /// bound to the TLS fingerprint that earned them, and replaying them on
    /// a different fingerprint triggers WAF flags.
    pub(crate) fn rebuild_transport(&self, inner: &mut SessionInner) -> WaferResult<()> {
        let config = TransportConfig {
            emulation: effective_emulation(inner),
            headers: self.client_headers(inner),
            connect_timeout: self.config.connect_timeout,
            timeout: self.config.timeout,
            proxy: self.config.proxy.clone(),
        };
        let transport = self
            .factory
            .build(&config)
            .map_err(|err| WaferError::Setup(err.to_string()))?;

        if let Some(ref cache) = self.cookie_cache {
            for domain in cache.list_domains() {
                for entry in cache.load(&domain) {
                    let Ok(url) = Url::parse(&entry.url) else {
                        continue;
                    };
                    if let Err(err) = transport.add_cookie(&entry.raw, &url) {
                        log::debug!("Failed to hydrate cookie {}: {err}", entry.name);
                    }
                }
            }
        }

        inner.transport = transport;
        log::debug!("Client rebuilt with emulation={}", effective_emulation(inner));
        Ok(())
    }

    /// Record a 403/429 failure; true means the retirement threshold was
    /// hit.
    fn record_failure(&self, inner: &mut SessionInner, domain: &str) -> bool {
        let count = inner
            .domain_failures
            .entry(domain.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        if let Some(max_failures) = self.config.max_failures
            && *count >= max_failures
        {
            log::warn!(
                "Session health: {count} consecutive failures for {domain} \
                 (threshold={max_failures}), retiring"
            );
            return true;
        }
        false
    }

    fn record_success(&self, inner: &mut SessionInner, domain: &str) {
        inner.domain_failures.remove(domain);
    }

    /// Full identity reset for a domain: restore Chrome if the Safari
    /// alternate was active, reset the fingerprint, drop the domain's
    /// cached cookies, rebuild the transport.
    fn retire_session(&self, inner: &mut SessionInner, domain: &str) -> WaferResult<()> {
        inner.safari_override = None;
        inner.fingerprint.reset(None);
        if let Some(ref cache) = self.cookie_cache {
            cache.clear(domain);
        }
        self.rebuild_transport(inner)?;
        inner.domain_failures.remove(domain);
        log::warn!(
            "Session retired for {domain}: emulation={}",
            effective_emulation(inner)
        );
        Ok(())
    }

    /// Progressive rotation ladder. Every step clears the domain's cached
    /// cookies first — stale cookies from a different TLS identity cause
    /// WAF re-challenges (cf_clearance and _abck are TLS-bound).
    ///
    /// Step 1: fresh TLS + cleared cookies only. Step 2: switch to the
    /// Safari alternate identity if the transport has one. Step 3: back to
    /// Chrome. Later steps rotate through the Chrome pool.
    fn rotate_identity(
        &self,
        inner: &mut SessionInner,
        domain: &str,
        rotation_retries: u32,
    ) -> WaferResult<()> {
        if let Some(ref cache) = self.cookie_cache {
            cache.clear(domain);
        }

        if rotation_retries <= 1 {
            // first rotation: fresh TLS and cleared cookies only
        } else if !inner.tried_safari
            && let Some(safari) = self.newest_safari()
        {
            inner.safari_override = Some(safari);
            inner.tried_safari = true;
            log::debug!("Switched to Safari alternate identity: {safari}");
        } else if inner.safari_override.take().is_some() {
            log::debug!(
                "Switched back to Chrome: {}",
                inner.fingerprint.current()
            );
        } else {
            inner.fingerprint.rotate();
        }

        self.rebuild_transport(inner)
    }

    fn newest_safari(&self) -> Option<Emulation> {
        self.factory
            .emulations()
            .into_iter()
            .filter(Emulation::is_safari)
            .max_by_key(|em| match em {
                Emulation::Safari(v) => *v,
                Emulation::Chrome(v) => *v,
            })
    }

    /// Write-through: persist a response's Set-Cookie headers to the disk
    /// cache.
    fn cache_response_cookies(&self, url: &Url, headers: &HeaderMap) {
        let Some(ref cache) = self.cookie_cache else {
            return;
        };
        let Some(domain) = url.host_str() else {
            return;
        };
        let raw_cookies: Vec<String> = headers
            .get_all("set-cookie")
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        if !raw_cookies.is_empty() {
            cache.save_from_headers(domain, &raw_cookies, url.as_str());
        }
    }

    /// Attempt inline challenge solving. Returns true when solved and the
    /// request should be retried.
    async fn try_inline_solve(
        &self,
        inner: &mut SessionInner,
        challenge: ChallengeType,
        body: &str,
        url: &Url,
    ) -> bool {
        match challenge {
            ChallengeType::Acw => {
                let Some(value) = solve_acw(body) else {
                    return false;
                };
                let cookie_str = format!("acw_sc__v2={value}; Path=/");
                if let Err(err) = inner.transport.add_cookie(&cookie_str, url) {
                    log::debug!("Failed to add ACW cookie: {err}");
                    return false;
                }
                if let Some(ref cache) = self.cookie_cache
                    && let Some(domain) = url.host_str()
                {
                    cache.save(
                        domain,
                        vec![CookieEntry {
                            name: "acw_sc__v2".to_string(),
                            raw: cookie_str,
                            url: url.to_string(),
                            expires: 0.0,
                            last_used: now_epoch(),
                        }],
                    );
                }
                log::info!("ACW challenge solved inline");
                true
            }

            ChallengeType::Amazon => {
                let Some(target) = parse_amazon_captcha(body, url) else {
                    return false;
                };
                let (target_url, request_body) = if target.method == Method::POST {
                    (
                        target.url.clone(),
                        Some(RequestBody::Form(target.params.clone())),
                    )
                } else {
                    let mut with_params = target.url.clone();
                    if !target.params.is_empty() {
                        with_params.query_pairs_mut().extend_pairs(
                            target.params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                        );
                    }
                    (with_params, None)
                };
                let request = TransportRequest {
                    method: target.method.clone(),
                    url: target_url.clone(),
                    headers: vec![("Referer".to_string(), url.to_string())],
                    body: request_body,
                    timeout: None,
                };
                match inner.transport.execute(request).await {
                    Ok(resp) => {
                        self.cache_response_cookies(&target_url, &resp.headers);
                        log::info!("Amazon captcha submitted inline to {target_url}");
                        true
                    }
                    Err(err) => {
                        log::debug!("Amazon inline solve failed: {err}");
                        false
                    }
                }
            }

            ChallengeType::Tmd => {
                let homepage = tmd_homepage_url(url);
                let request = TransportRequest {
                    method: Method::GET,
                    url: homepage.clone(),
                    headers: Vec::new(),
                    body: None,
                    timeout: None,
                };
                match inner.transport.execute(request).await {
                    Ok(resp) => {
                        self.cache_response_cookies(&homepage, &resp.headers);
                        log::info!("TMD session warmed via {homepage}");
                        true
                    }
                    Err(err) => {
                        log::debug!("TMD homepage fetch failed: {err}");
                        false
                    }
                }
            }

            _ => false,
        }
    }

    /// Attempt a browser-based solve and fold the result back into the
    /// session: persist cookies, store Kasada tokens, re-align the
    /// fingerprint with the browser's Chrome version, rebuild the
    /// transport, inject cookies into the fresh jar.
    async fn try_browser_solve(
        &self,
        inner: &mut SessionInner,
        challenge: ChallengeType,
        url: &Url,
        deadline: Option<Instant>,
        state: &RetryState,
    ) -> BrowserStep {
        let Some(ref solver) = self.browser_solver else {
            return BrowserStep::Failed;
        };
        let solver_timeout = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(self.config.timeout);

        let Some(solution) = solver.solve(url, challenge, solver_timeout).await else {
            return BrowserStep::Failed;
        };

        let domain = host_of(url);
        // The browser context returns cookies for every domain it touched,
        // including challenge CDNs like challenges.cloudflare.com — keep
        // only the target domain and its parents, falling back to all when
        // the filter matches nothing.
        let bare_domain = domain.strip_prefix("www.").unwrap_or(&domain);
        let mut target_cookies: Vec<_> = solution
            .cookies
            .iter()
            .filter(|c| {
                !bare_domain.is_empty()
                    && c.domain.trim_start_matches('.').ends_with(bare_domain)
            })
            .cloned()
            .collect();
        if target_cookies.is_empty() {
            target_cookies = solution.cookies.clone();
        }

        if let Some(ref cache) = self.cookie_cache
            && !domain.is_empty()
        {
            let now = now_epoch();
            let entries: Vec<CookieEntry> = target_cookies
                .iter()
                .map(|cookie| CookieEntry {
                    name: cookie.name.clone(),
                    raw: cookie.to_set_cookie(),
                    url: url.to_string(),
                    expires: cookie.expires.filter(|e| *e >= 0.0).unwrap_or(0.0),
                    last_used: now,
                })
                .collect();
            cache.save(&domain, entries);
        }

        // Cache Kasada CT/ST for per-request CD generation
        if let Some(ref tokens) = solution.kasada {
            self.kasada
                .store(&domain, tokens.ct.clone(), tokens.st, target_cookies.clone());
        }

        // Match the TLS emulation to the browser's Chrome version. Safari
        // user agents map to nothing and keep their TLS identity.
        if let Some(version) = chrome_version_from_ua(&solution.user_agent)
            && let Some(profile) = inner.fingerprint.profile_for_version(version)
        {
            inner.fingerprint.reset(Some(profile));
            inner.safari_override = None;
        }

        // Rebuild (rehydrates cookies from cache), then inject directly
        // into the jar as well to cover the cache-disabled case.
        if let Err(err) = self.rebuild_transport(inner) {
            log::warn!("Transport rebuild after browser solve failed: {err}");
            return BrowserStep::Failed;
        }
        for cookie in &target_cookies {
            if let Err(err) = inner.transport.add_cookie(&cookie.to_set_cookie(), url) {
                log::debug!("Failed to inject cookie {}: {err}", cookie.name);
            }
        }

        if let Some(pass) = solution.response {
            log::info!(
                "Browser passthrough {challenge} at {url} ({} cookies injected, {} bytes)",
                target_cookies.len(),
                pass.body.len()
            );
            let text = String::from_utf8_lossy(&pass.body).into_owned();
            let headers: HashMap<String, String> = pass
                .headers
                .into_iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value))
                .collect();
            return BrowserStep::Passthrough(WaferResponse::from_parts(
                pass.status,
                headers,
                pass.url,
                Bytes::from(pass.body),
                Some(text),
                None,
                true,
                Duration::ZERO,
                (
                    state.normal_retries,
                    state.rotation_retries,
                    state.inline_solves,
                ),
                None,
            ));
        }

        log::info!(
            "Browser solved {challenge} at {url} ({} cookies injected)",
            target_cookies.len()
        );
        BrowserStep::Solved
    }
}

/// Record the URL for referer chain tracking.
fn record_url(inner: &mut SessionInner, url: &Url) {
    if let Some(domain) = url.host_str() {
        inner.last_url.insert(domain.to_string(), url.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_content_types() {
        assert!(is_binary_content_type("image/png"));
        assert!(is_binary_content_type("application/pdf"));
        assert!(is_binary_content_type("application/vnd.ms-excel"));
        assert!(is_binary_content_type("Font/woff2"));
        assert!(is_binary_content_type("application/zip; charset=binary"));
        assert!(!is_binary_content_type("text/html; charset=utf-8"));
        assert!(!is_binary_content_type("application/json"));
        assert!(!is_binary_content_type(""));
    }

    #[test]
    fn challengeable_content_types() {
        assert!(is_challengeable_content_type("text/html"));
        assert!(is_challengeable_content_type("text/html; charset=utf-8"));
        assert!(is_challengeable_content_type("application/xhtml+xml"));
        assert!(is_challengeable_content_type(""));
        assert!(!is_challengeable_content_type("application/json"));
        assert!(!is_challengeable_content_type("text/xml"));
    }

    #[test]
    fn decode_headers_joins_multi_values() {
        let mut map = HeaderMap::new();
        map.append("Set-Cookie", "a=1; Path=/".parse().unwrap());
        map.append("Set-Cookie", "b=2; Path=/".parse().unwrap());
        map.insert("Content-Type", "text/html".parse().unwrap());

        let decoded = decode_headers(&map);
        assert_eq!(decoded["set-cookie"], "a=1; Path=/; b=2; Path=/");
        assert_eq!(decoded["content-type"], "text/html");
    }

    #[test]
    fn rotation_delay_has_a_floor_and_grows() {
        let first = rotation_delay(1).as_secs_f64();
        assert!(first >= 2.0 && first <= 3.0, "{first}");
        let third = rotation_delay(3).as_secs_f64();
        assert!(third >= 8.0, "{third}");
    }
}
