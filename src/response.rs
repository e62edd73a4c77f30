//! User-facing response wrapper.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;

use crate::challenge::ChallengeType;
use crate::errors::{WaferError, WaferResult};
use crate::retry::parse_retry_after;

/// Response returned by [`crate::Session`] requests.
///
/// Provides a requests/httpx-like surface: `status_code`, raw `content`,
/// lazily decoded `text`, lowercase `headers` (multi-value headers joined
/// with `"; "`), the final `url`, and per-request retry counters.
#[derive(Debug)]
pub struct WaferResponse {
    pub status_code: u16,
    /// Headers with lowercase names; repeated headers joined with `"; "`.
    pub headers: HashMap<String, String>,
    /// Final URL after redirects.
    pub url: String,
    /// Challenge family the last iteration saw, when the engine returned a
    /// challenged response instead of raising (bulk mode).
    pub challenge_type: Option<ChallengeType>,
    pub was_retried: bool,
    pub elapsed: Duration,
    /// Normal retries consumed by this request.
    pub retries: u32,
    /// Fingerprint rotations consumed by this request.
    pub rotations: u32,
    /// Inline challenge solves performed for this request.
    pub inline_solves: u32,
    content: Bytes,
    text: OnceCell<String>,
    /// Raw header map kept for `get_all` fidelity.
    raw: Option<HeaderMap>,
}

impl WaferResponse {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        status_code: u16,
        headers: HashMap<String, String>,
        url: String,
        content: Bytes,
        text: Option<String>,
        challenge_type: Option<ChallengeType>,
        was_retried: bool,
        elapsed: Duration,
        counters: (u32, u32, u32),
        raw: Option<HeaderMap>,
    ) -> Self {
        let cell = OnceCell::new();
        if let Some(text) = text {
            let _ = cell.set(text);
        }
        let (retries, rotations, inline_solves) = counters;
        Self {
            status_code,
            headers,
            url,
            challenge_type,
            was_retried,
            elapsed,
            retries,
            rotations,
            inline_solves,
            content,
            text: cell,
            raw,
        }
    }

    /// Raw response body.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Body decoded as text (UTF-8 with replacement), decoded on first
    /// access and cached.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.content).into_owned())
    }

    /// `true` for 2xx status codes.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Parsed `Retry-After` header value in seconds.
    pub fn retry_after(&self) -> Option<f64> {
        parse_retry_after(self.headers.get("retry-after").map_or("", String::as_str))
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self.text())
    }

    /// Error out on non-2xx status codes.
    pub fn error_for_status(self) -> WaferResult<Self> {
        if self.ok() {
            Ok(self)
        } else {
            Err(WaferError::Http {
                status_code: self.status_code,
                url: self.url,
            })
        }
    }

    /// All values for a header (e.g. the individual Set-Cookie lines).
    pub fn get_all(&self, name: &str) -> Vec<String> {
        match self.raw {
            Some(ref raw) => raw
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect(),
            None => self
                .headers
                .get(&name.to_ascii_lowercase())
                .filter(|value| !value.is_empty())
                .map(|value| vec![value.clone()])
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response(status: u16, body: &str, headers: &[(&str, &str)]) -> WaferResponse {
        WaferResponse::from_parts(
            status,
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            "https://example.com/".to_string(),
            Bytes::from(body.as_bytes().to_vec()),
            None,
            None,
            false,
            Duration::ZERO,
            (0, 0, 0),
            None,
        )
    }

    #[test]
    fn ok_covers_2xx_only() {
        assert!(response(200, "", &[]).ok());
        assert!(response(204, "", &[]).ok());
        assert!(!response(301, "", &[]).ok());
        assert!(!response(403, "", &[]).ok());
    }

    #[test]
    fn text_decodes_lazily_with_replacement() {
        let resp = WaferResponse::from_parts(
            200,
            HashMap::new(),
            "https://example.com/".to_string(),
            Bytes::from(vec![0x68, 0x69, 0xff]),
            None,
            None,
            false,
            Duration::ZERO,
            (0, 0, 0),
            None,
        );
        assert_eq!(resp.text(), "hi\u{fffd}");
        // cached value on second access
        assert_eq!(resp.text(), "hi\u{fffd}");
    }

    #[test]
    fn json_parses_body() {
        let resp = response(200, r#"{"answer": 42}"#, &[]);
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["answer"], 42);
    }

    #[test]
    fn error_for_status_raises_http_error() {
        let err = response(404, "", &[]).error_for_status().unwrap_err();
        match err {
            WaferError::Http { status_code, url } => {
                assert_eq!(status_code, 404);
                assert_eq!(url, "https://example.com/");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn retry_after_reads_joined_headers() {
        let resp = response(429, "", &[("retry-after", "7")]);
        assert_eq!(resp.retry_after(), Some(7.0));
        assert_eq!(response(429, "", &[]).retry_after(), None);
    }

    #[test]
    fn get_all_prefers_raw_header_map() {
        let mut raw = HeaderMap::new();
        raw.append("set-cookie", HeaderValue::from_static("a=1; Path=/"));
        raw.append("set-cookie", HeaderValue::from_static("b=2; Path=/"));
        let resp = WaferResponse::from_parts(
            200,
            [("set-cookie".to_string(), "a=1; Path=/; b=2; Path=/".to_string())].into(),
            "https://example.com/".to_string(),
            Bytes::new(),
            None,
            None,
            false,
            Duration::ZERO,
            (0, 0, 0),
            Some(raw),
        );
        assert_eq!(resp.get_all("set-cookie"), vec!["a=1; Path=/", "b=2; Path=/"]);
        assert_eq!(
            resp.get_all("Set-Cookie"),
            vec!["a=1; Path=/", "b=2; Path=/"]
        );

        let flat = response(200, "", &[("x-one", "v")]);
        assert_eq!(flat.get_all("X-One"), vec!["v"]);
        assert!(flat.get_all("missing").is_empty());
    }
}
