//! Per-request header delta construction.
//!
//! The transport carries a fixed client-level header set (session defaults
//! plus client hints). At request time the full desired header map is
//! rebuilt — embed impersonation, auto-referer, Kasada tokens, per-request
//! overrides — and only the delta relative to the client-level set is sent.
//! Sending the full set again would duplicate headers at the HTTP/2 frame
//! level, which strict WAFs detect as non-browser behavior.
//!
//! An empty-string value suppresses a header entirely, including a
//! client-level default.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use url::Url;

use crate::kasada::{KasadaStore, generate_cd};
use crate::session::{EmbedMode, SessionConfig};

/// Pick a referer from the embed pool, stripped to `origin/`.
fn pick_origin_referer(referers: &[String]) -> Option<String> {
    let pick = referers.choose(&mut rand::thread_rng())?;
    let parsed = Url::parse(pick).ok()?;
    Some(format!("{}/", parsed.origin().ascii_serialization()))
}

pub(crate) fn build_header_delta(
    client_headers: &HashMap<String, String>,
    config: &SessionConfig,
    last_url: &HashMap<String, String>,
    kasada: &KasadaStore,
    url: &Url,
    extra: Option<&HashMap<String, String>>,
) -> Vec<(String, String)> {
    let mut merged = client_headers.clone();
    let domain = url.host_str().unwrap_or_default().to_string();

    match config.embed {
        Some(EmbedMode::Xhr) => {
            // XHR/fetch impersonation. No X-Requested-With: fetch() never
            // sets it.
            merged.insert(
                "Origin".to_string(),
                config.embed_origin.clone().unwrap_or_default(),
            );
            merged.insert("Sec-Fetch-Site".to_string(), "cross-site".to_string());
            merged.insert("Sec-Fetch-Mode".to_string(), "cors".to_string());
            merged.insert("Sec-Fetch-Dest".to_string(), "empty".to_string());
            merged.insert("Accept".to_string(), "*/*".to_string());
            merged.remove("Upgrade-Insecure-Requests");
            merged.remove("Cache-Control");
            if let Some(referer) = pick_origin_referer(&config.embed_referers) {
                merged.insert("Referer".to_string(), referer);
            }
            log::debug!(
                "Embed mode (xhr): Origin={}, Referer={}",
                config.embed_origin.as_deref().unwrap_or("(none)"),
                merged.get("Referer").map_or("(none)", String::as_str)
            );
        }
        Some(EmbedMode::Iframe) => {
            // Iframe navigation impersonation; no Origin for GET
            merged.insert("Sec-Fetch-Site".to_string(), "cross-site".to_string());
            merged.insert("Sec-Fetch-Mode".to_string(), "navigate".to_string());
            merged.insert("Sec-Fetch-Dest".to_string(), "iframe".to_string());
            if let Some(referer) = pick_origin_referer(&config.embed_referers) {
                merged.insert("Referer".to_string(), referer);
            }
        }
        None => {
            // Normal referer chain: auto-set from the last URL on this
            // domain unless the caller overrides it.
            if !merged.contains_key("Referer") {
                if let Some(last) = last_url.get(&domain) {
                    merged.insert("Referer".to_string(), last.clone());
                    log::debug!("Auto-Referer: {last}");
                }
            }
        }
    }

    // Kasada: inject CT + CD when the domain has a live session with a
    // valid ST. Sending CT without CD is worse than neither — Kasada
    // rejects unaccompanied tokens.
    if let Some(session) = kasada.get(&domain) {
        if session.st != 0 {
            merged.insert("x-kpsdk-ct".to_string(), session.ct.clone());
            merged.insert("x-kpsdk-cd".to_string(), generate_cd(session.st));
        }
    }

    // Per-request overrides win
    if let Some(extra) = extra {
        for (name, value) in extra {
            merged.insert(name.clone(), value.clone());
        }
    }

    // Emit only the delta: headers absent from the client-level set or
    // carrying a different value. Empty strings (the suppression
    // mechanism) are dropped last, after overrides.
    merged
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .filter(|(name, value)| client_headers.get(name) != Some(value))
        .collect()
}
