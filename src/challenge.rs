//! Challenge detection for 14+ WAF families.
//!
//! Pure logic, no I/O. Inspects status code, headers, and body to identify
//! which WAF/challenge system is blocking a request.
//!
//! Detection order is intentional:
//! 1. Header fast path — no body inspection needed
//! 2. Inline-solvable challenges (ACW, TMD, Amazon) — cheapest to resolve
//! 3. Browser-solvable challenges (Cloudflare, Akamai, DataDome, …)
//! 4. Generic JS fallback last

use std::collections::HashMap;
use std::fmt;

/// WAF/challenge families that wafer can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    Cloudflare,
    Akamai,
    Datadome,
    Perimeterx,
    Imperva,
    Kasada,
    Shape,
    Awswaf,
    Acw,
    Tmd,
    Amazon,
    Vercel,
    Arkose,
    Recaptcha,
    Hcaptcha,
    GenericJs,
}

impl ChallengeType {
    /// Wire name used in logs, error messages, and [`crate::WaferResponse`].
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Cloudflare => "cloudflare",
            ChallengeType::Akamai => "akamai",
            ChallengeType::Datadome => "datadome",
            ChallengeType::Perimeterx => "perimeterx",
            ChallengeType::Imperva => "imperva",
            ChallengeType::Kasada => "kasada",
            ChallengeType::Shape => "shape",
            ChallengeType::Awswaf => "awswaf",
            ChallengeType::Acw => "acw",
            ChallengeType::Tmd => "tmd",
            ChallengeType::Amazon => "amazon",
            ChallengeType::Vercel => "vercel",
            ChallengeType::Arkose => "arkose",
            ChallengeType::Recaptcha => "recaptcha",
            ChallengeType::Hcaptcha => "hcaptcha",
            ChallengeType::GenericJs => "generic_js",
        }
    }

    /// Challenges that require JS execution to solve. Fingerprint rotation
    /// alone rarely helps — the browser solver is tried early for these.
    pub fn is_js_only(&self) -> bool {
        matches!(
            self,
            ChallengeType::Awswaf
                | ChallengeType::Cloudflare
                | ChallengeType::Kasada
                | ChallengeType::Vercel
                | ChallengeType::GenericJs
        )
    }

    /// Challenges solvable inline with a pure transform, no browser.
    pub fn is_inline_solvable(&self) -> bool {
        matches!(
            self,
            ChallengeType::Acw | ChallengeType::Tmd | ChallengeType::Amazon
        )
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive ASCII substring search without allocating a lowercased
/// copy of the body.
fn contains_ci(haystack: &str, needle: &str) -> bool {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() {
        return true;
    }
    if h.len() < n.len() {
        return false;
    }
    h.windows(n.len()).any(|w| w.eq_ignore_ascii_case(n))
}

/// Check if a Set-Cookie header sets a cookie with the given name.
///
/// Looks for `name=` so cookie names that are substrings of other names
/// (e.g. `_px3` inside `my_px3_token`) do not match.
fn has_cookie(set_cookie: &str, name: &str) -> bool {
    set_cookie
        .match_indices(name)
        .any(|(idx, _)| set_cookie[idx + name.len()..].starts_with('='))
}

/// Header-only detection — no body inspection needed.
fn header_fast_path(
    status_code: u16,
    headers: &HashMap<String, String>,
    set_cookie: &str,
) -> Option<ChallengeType> {
    // Cloudflare explicit challenge header
    if headers.get("cf-mitigated").map(String::as_str) == Some("challenge") {
        return Some(ChallengeType::Cloudflare);
    }

    // Vercel mitigation header
    if headers.get("x-vercel-mitigated").map(String::as_str) == Some("challenge") {
        return Some(ChallengeType::Vercel);
    }

    // Kasada — x-kpsdk-* headers on 429
    if status_code == 429 && headers.keys().any(|k| k.starts_with("x-kpsdk")) {
        return Some(ChallengeType::Kasada);
    }

    // AWS WAF action header
    if matches!(
        headers.get("x-amzn-waf-action").map(String::as_str),
        Some("captcha") | Some("challenge")
    ) {
        return Some(ChallengeType::Awswaf);
    }

    // DataDome — datadome cookie + block status
    if matches!(status_code, 403 | 429) && has_cookie(set_cookie, "datadome") {
        return Some(ChallengeType::Datadome);
    }

    // PerimeterX — _px cookies + block status
    if matches!(status_code, 403 | 429)
        && (has_cookie(set_cookie, "_px3") || has_cookie(set_cookie, "_pxhd"))
    {
        return Some(ChallengeType::Perimeterx);
    }

    // Imperva — reese84 or ___utmvc cookie + 403
    if status_code == 403
        && (has_cookie(set_cookie, "reese84") || has_cookie(set_cookie, "___utmvc"))
    {
        return Some(ChallengeType::Imperva);
    }

    // Imperva — x-cdn header identifying the Incapsula CDN on block status
    if matches!(status_code, 403 | 429) {
        if let Some(x_cdn) = headers.get("x-cdn") {
            if contains_ci(x_cdn, "incapsula") || contains_ci(x_cdn, "imperva") {
                return Some(ChallengeType::Imperva);
            }
        }
    }

    // Akamai — _abck / ak_bmsc cookie + 403
    if status_code == 403
        && (has_cookie(set_cookie, "_abck") || has_cookie(set_cookie, "ak_bmsc"))
    {
        return Some(ChallengeType::Akamai);
    }

    // F5 Shape — sensor headers have site-specific prefixes (x-<prefix>-a)
    // but always keep the -a suffix for the primary sensor. Short x-*-a
    // headers with a numeric or long encoded value are Shape responses.
    // Intentionally conservative; may false-positive on unrelated custom
    // headers, hence the info log.
    if matches!(status_code, 200 | 403 | 429) {
        for (key, val) in headers {
            if key.starts_with("x-") && key.ends_with("-a") && key.len() <= 20 {
                let first_is_digit = val.chars().next().is_some_and(|c| c.is_ascii_digit());
                if !val.is_empty() && (first_is_digit || val.len() > 40) {
                    log::info!("Shape sensor header heuristic matched: {key}");
                    return Some(ChallengeType::Shape);
                }
            }
        }
    }

    None
}

/// Detect a bot challenge from an HTTP response.
///
/// `headers` must be keyed lowercase; `set-cookie` may hold every Set-Cookie
/// line joined with `"; "`. `body` is the decoded response text. Purely
/// functional — identical inputs always produce identical output.
pub fn classify(
    status_code: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> Option<ChallengeType> {
    let empty = String::new();
    let set_cookie = headers.get("set-cookie").unwrap_or(&empty);

    if let Some(result) = header_fast_path(status_code, headers, set_cookie) {
        log::info!("Challenge detected (header): {result}");
        return Some(result);
    }

    // --- Inline-solvable challenges (cheapest first) ---

    // ACW (Alibaba Cloud WAF) — acw_sc__v2 marker in body
    if contains_ci(body, "acw_sc__v2") && contains_ci(body, "arg1") {
        log::info!("Challenge detected: acw");
        return Some(ChallengeType::Acw);
    }

    // TMD (Alibaba) — punish page, status 200
    if status_code == 200 && contains_ci(body, "/_____tmd_____/punish") {
        log::info!("Challenge detected: tmd");
        return Some(ChallengeType::Tmd);
    }

    // Amazon rate-limit captcha — status 200, small body, "Continue shopping"
    if status_code == 200
        && body.len() < 50_000
        && contains_ci(body, "continue shopping")
        && (contains_ci(body, "amazon")
            || contains_ci(body, "amzn")
            || contains_ci(body, "/errors/validatecaptcha"))
    {
        log::info!("Challenge detected: amazon");
        return Some(ChallengeType::Amazon);
    }

    // --- Browser-solvable challenges ---

    // Cloudflare body markers (older configs omit cf-mitigated); CF
    // challenges come on 403 and 503.
    if matches!(status_code, 403 | 503)
        && (contains_ci(body, "window._cf_chl_opt")
            || contains_ci(body, "_cf_chl_ctx")
            || contains_ci(body, "challenge-form"))
    {
        log::info!("Challenge detected (body): cloudflare");
        return Some(ChallengeType::Cloudflare);
    }

    // AWS WAF — aws-waf-token cookie + block status (202 = JS challenge)
    if has_cookie(set_cookie, "aws-waf-token")
        && matches!(status_code, 202 | 403 | 405 | 429)
    {
        log::info!("Challenge detected: awswaf");
        return Some(ChallengeType::Awswaf);
    }

    // AWS WAF — 202 with challenge body (gokuProps is the JS challenge SDK)
    if status_code == 202
        && (contains_ci(body, "gokuProps") || contains_ci(body, "awsWafCookieDomainList"))
    {
        log::info!("Challenge detected (body): awswaf");
        return Some(ChallengeType::Awswaf);
    }

    // Akamai — _abck / ak_bmsc cookie + body markers
    if has_cookie(set_cookie, "_abck") || has_cookie(set_cookie, "ak_bmsc") {
        if status_code != 200
            && (contains_ci(body, "bmSz")
                || contains_ci(body, "sensor_data")
                || contains_ci(body, "_BomA"))
        {
            log::info!("Challenge detected (body): akamai");
            return Some(ChallengeType::Akamai);
        }
        // Akamai behavioral challenge — 200 with a tiny challenge page
        if status_code == 200
            && body.len() < 10_000
            && (contains_ci(body, "sec-if-cpt") || contains_ci(body, "behavioral-content"))
        {
            log::info!("Challenge detected (body): akamai behavioral");
            return Some(ChallengeType::Akamai);
        }
    }

    // F5 Shape body markers — any status code because Shape returns 200 for
    // interstitial challenge pages.
    if contains_ci(body, "istlwashere") || contains_ci(body, "_imp_apg_r_") {
        log::info!("Challenge detected (body): shape");
        return Some(ChallengeType::Shape);
    }

    // Body-based detection for block statuses
    if matches!(status_code, 403 | 429) {
        // bazadebezolkohpepadr is the obfuscated global set by Akamai Bot
        // Manager's sensor script.
        if status_code == 403
            && (contains_ci(body, "akam")
                || contains_ci(body, "akamai")
                || contains_ci(body, "bazadebezolkohpepadr"))
        {
            log::info!("Challenge detected (body): akamai");
            return Some(ChallengeType::Akamai);
        }

        if contains_ci(body, "datadome") || contains_ci(body, "dd.js") {
            log::info!("Challenge detected (body): datadome");
            return Some(ChallengeType::Datadome);
        }

        // PerimeterX also blocks with 429
        if contains_ci(body, "perimeterx")
            || contains_ci(body, "human.security")
            || contains_ci(body, "press & hold")
            || contains_ci(body, "px-captcha")
        {
            log::info!("Challenge detected (body): perimeterx");
            return Some(ChallengeType::Perimeterx);
        }

        if status_code == 403
            && (contains_ci(body, "incapsula") || contains_ci(body, "imperva"))
        {
            log::info!("Challenge detected (body): imperva");
            return Some(ChallengeType::Imperva);
        }

        // Modern Kasada uses p.js via double-UUID paths, legacy uses ips.js
        if contains_ci(body, "ips.js") || contains_ci(body, "kpsdk") || body.contains("/p.js") {
            log::info!("Challenge detected (body): kasada");
            return Some(ChallengeType::Kasada);
        }

        if contains_ci(body, "aws-waf-token") || contains_ci(body, "awswafjschallenge") {
            log::info!("Challenge detected (body): awswaf");
            return Some(ChallengeType::Awswaf);
        }

        if contains_ci(body, "arkoselabs.com") || contains_ci(body, "funcaptcha") {
            log::info!("Challenge detected (body): arkose");
            return Some(ChallengeType::Arkose);
        }

        // Generic JS fallback — block status with a script tag + small body
        if contains_ci(body, "<script") && body.len() < 50_000 {
            log::info!("Challenge detected: generic_js");
            return Some(ChallengeType::GenericJs);
        }
    }

    // Imperva interstitials — served as 200 with a tiny body. The
    // _Incapsula_Resource script path is unique to Imperva challenge pages;
    // the x-cdn header alone is NOT sufficient (real pages behind the
    // Imperva CDN carry it too, causing false re-detection after solve).
    if status_code == 200 && body.len() < 5_000 && contains_ci(body, "_incapsula_resource") {
        log::info!("Challenge detected (body): imperva interstitial");
        return Some(ChallengeType::Imperva);
    }

    // Arkose Labs on 200 — embedded enforcement widget on login/signup pages
    if status_code == 200
        && body.len() < 100_000
        && (contains_ci(body, "arkoselabs.com") || contains_ci(body, "funcaptcha"))
    {
        log::info!("Challenge detected (body): arkose");
        return Some(ChallengeType::Arkose);
    }

    // reCAPTCHA / hCaptcha enforcement pages — vendor script on small 200s
    if status_code == 200 && body.len() < 100_000 {
        if contains_ci(body, "www.google.com/recaptcha/api.js")
            || contains_ci(body, "g-recaptcha")
        {
            log::info!("Challenge detected (body): recaptcha");
            return Some(ChallengeType::Recaptcha);
        }
        if contains_ci(body, "hcaptcha.com/1/api.js") || contains_ci(body, "h-captcha") {
            log::info!("Challenge detected (body): hcaptcha");
            return Some(ChallengeType::Hcaptcha);
        }
    }

    None
}
