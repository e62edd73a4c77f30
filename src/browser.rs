//! Browser solver collaborator contract.
//!
//! The headless-browser solver itself lives outside the core; the engine
//! only needs the trait below. A solve either yields cookies to replay over
//! TLS, or a passthrough response when the browser already received real
//! content (in which case the engine must NOT re-send the request).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use url::Url;

use crate::challenge::ChallengeType;

/// One cookie captured from the browser context.
#[derive(Debug, Clone)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Epoch seconds; `None` (or negative) marks a session cookie.
    pub expires: Option<f64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

impl BrowserCookie {
    /// Render the cookie as a Set-Cookie line suitable for jar injection
    /// and disk caching.
    pub fn to_set_cookie(&self) -> String {
        let mut parts = vec![format!("{}={}", self.name, self.value)];
        if !self.domain.is_empty() {
            parts.push(format!("Domain={}", self.domain));
        }
        if !self.path.is_empty() {
            parts.push(format!("Path={}", self.path));
        }
        if let Some(expires) = self.expires {
            if expires >= 0.0 {
                if let Some(when) = Utc.timestamp_opt(expires as i64, 0).single() {
                    parts.push(format!(
                        "Expires={}",
                        when.format("%a, %d %b %Y %H:%M:%S GMT")
                    ));
                }
            }
        }
        if self.secure {
            parts.push("Secure".to_string());
        }
        if self.http_only {
            parts.push("HttpOnly".to_string());
        }
        if let Some(ref same_site) = self.same_site {
            parts.push(format!("SameSite={same_site}"));
        }
        parts.join("; ")
    }
}

/// Kasada tokens captured during a browser solve.
#[derive(Debug, Clone)]
pub struct KasadaTokens {
    /// `x-kpsdk-ct` from the /tl response.
    pub ct: String,
    /// `x-kpsdk-st` server time.
    pub st: i64,
}

/// Real content the browser received while solving (passthrough case).
#[derive(Debug, Clone)]
pub struct PassthroughResponse {
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Outcome of a successful browser solve.
#[derive(Debug, Clone)]
pub struct BrowserSolution {
    /// Cookies for every domain the browser context touched; the engine
    /// filters them to the target domain.
    pub cookies: Vec<BrowserCookie>,
    /// The browser's User-Agent, used to re-align the TLS fingerprint.
    pub user_agent: String,
    /// Present for Kasada solves only.
    pub kasada: Option<KasadaTokens>,
    /// Present when the browser received real content without a challenge.
    pub response: Option<PassthroughResponse>,
}

/// External headless-browser challenge solver.
#[async_trait]
pub trait BrowserSolver: Send + Sync {
    /// Navigate `url`, defeat `challenge`, and report what was captured.
    /// `None` means the solve failed.
    async fn solve(
        &self,
        url: &Url,
        challenge: ChallengeType,
        timeout: Duration,
    ) -> Option<BrowserSolution>;

    /// Release the underlying browser process. Called on session close.
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_full_set_cookie_line() {
        let cookie = BrowserCookie {
            name: "cf_clearance".to_string(),
            value: "abc123".to_string(),
            domain: ".example.com".to_string(),
            path: "/".to_string(),
            expires: Some(4102444800.0), // 2100-01-01
            secure: true,
            http_only: true,
            same_site: Some("None".to_string()),
        };
        let line = cookie.to_set_cookie();
        assert!(line.starts_with("cf_clearance=abc123; "));
        assert!(line.contains("Domain=.example.com"));
        assert!(line.contains("Path=/"));
        assert!(line.contains("Expires=Fri, 01 Jan 2100 00:00:00 GMT"));
        assert!(line.contains("Secure"));
        assert!(line.contains("HttpOnly"));
        assert!(line.contains("SameSite=None"));
    }

    #[test]
    fn session_cookie_omits_expires() {
        let cookie = BrowserCookie {
            name: "sid".to_string(),
            value: "x".to_string(),
            domain: String::new(),
            path: "/".to_string(),
            expires: Some(-1.0),
            secure: false,
            http_only: false,
            same_site: None,
        };
        let line = cookie.to_set_cookie();
        assert_eq!(line, "sid=x; Path=/");
    }
}
