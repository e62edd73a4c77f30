//! Cookie cache: JSON disk persistence with TTL and LRU eviction.
//!
//! Each domain gets one JSON file at `{cache_dir}/{sanitized_domain}.json`.
//! Writes are atomic (temp file + rename) with per-domain locks so
//! concurrent saves to the same domain serialize while distinct domains
//! proceed in parallel. Load failures never propagate: malformed JSON or
//! I/O errors produce an empty list and a debug log.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_MAX_ENTRIES: usize = 50;
const SWEEP_EVERY: u32 = 10;
const STALE_FILE_SECS: f64 = 86_400.0;

/// Extract the hostname from a URL string.
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// One persisted cookie. `expires == 0` marks a session cookie, which never
/// survives a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieEntry {
    pub name: String,
    /// The full Set-Cookie line as received.
    pub raw: String,
    pub url: String,
    #[serde(default)]
    pub expires: f64,
    #[serde(default)]
    pub last_used: f64,
}

pub(crate) fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Extract the cookie name from a Set-Cookie header value.
fn parse_cookie_name(raw: &str) -> Option<&str> {
    let eq = raw.find('=')?;
    if eq == 0 {
        return None;
    }
    let name = raw[..eq].trim();
    (!name.is_empty()).then_some(name)
}

/// Extract the expiry timestamp from a Set-Cookie line, or 0 for session
/// cookies. `Max-Age` takes precedence over `Expires` (RFC 6265).
fn parse_cookie_expires(raw: &str, now: f64) -> f64 {
    let lower = raw.to_ascii_lowercase();

    if let Some(idx) = lower.find("max-age=") {
        let rest = &raw[idx + 8..];
        let val = rest.split(';').next().unwrap_or(rest).trim();
        if let Ok(secs) = val.parse::<i64>() {
            return now + secs.max(0) as f64;
        }
    }

    if let Some(idx) = lower.find("expires=") {
        let rest = &raw[idx + 8..];
        let val = rest.split(';').next().unwrap_or(rest).trim();
        // HTTP-date per RFC 7231
        if let Ok(parsed) = DateTime::parse_from_rfc2822(val) {
            return parsed.timestamp() as f64;
        }
    }

    0.0
}

/// JSON-file-per-domain cookie cache with TTL and LRU eviction.
pub struct CookieCache {
    cache_dir: PathBuf,
    max_entries: usize,
    sweep_counter: Mutex<u32>,
    domain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CookieCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
            sweep_counter: Mutex::new(0),
            domain_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    fn domain_path(&self, domain: &str) -> PathBuf {
        let safe: String = domain
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        self.cache_dir.join(format!("{safe}.json"))
    }

    fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        let mut locks = self.domain_locks.lock().expect("cookie lock map poisoned");
        locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load entries from disk without TTL filtering.
    fn load_raw(&self, domain: &str) -> Vec<CookieEntry> {
        let path = self.domain_path(domain);
        if !path.exists() {
            return Vec::new();
        }
        match fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<Vec<CookieEntry>>(&data) {
                Ok(entries) => entries,
                Err(err) => {
                    log::debug!("Corrupt cookie file for {domain}, ignoring: {err}");
                    Vec::new()
                }
            },
            Err(err) => {
                log::debug!("Failed to load cookies for {domain}: {err}");
                Vec::new()
            }
        }
    }

    /// Load non-expired cookies for a domain. Session cookies (`expires ==
    /// 0`) are skipped — they must not survive across process restarts.
    pub fn load(&self, domain: &str) -> Vec<CookieEntry> {
        let now = now_epoch();
        self.load_raw(domain)
            .into_iter()
            .filter(|entry| entry.expires != 0.0 && entry.expires > now)
            .map(|mut entry| {
                entry.last_used = now;
                entry
            })
            .collect()
        // Expired entries are not rewritten here — that would race with
        // save(), which holds the domain lock. Compaction happens on the
        // next save() and in the sweep.
    }

    /// Save cookies with name-merge (latest wins), TTL compaction, and LRU
    /// eviction.
    pub fn save(&self, domain: &str, cookies: Vec<CookieEntry>) {
        if cookies.is_empty() {
            return;
        }
        let now = now_epoch();

        // Sweep stale domain files every ~10 saves
        let do_sweep = {
            let mut counter = self.sweep_counter.lock().expect("sweep counter poisoned");
            *counter += 1;
            if *counter >= SWEEP_EVERY {
                *counter = 0;
                true
            } else {
                false
            }
        };
        if do_sweep {
            self.sweep_expired(now);
        }

        let lock = self.domain_lock(domain);
        let _guard = lock.lock().expect("domain lock poisoned");

        let mut merged: Vec<CookieEntry> = self.load_raw(domain);
        for mut cookie in cookies {
            if cookie.name.is_empty() {
                continue;
            }
            if cookie.last_used == 0.0 {
                cookie.last_used = now;
            }
            match merged.iter_mut().find(|e| e.name == cookie.name) {
                Some(existing) => *existing = cookie,
                None => merged.push(cookie),
            }
        }

        // TTL compaction - drops session cookies (expires=0) and expired
        merged.retain(|entry| entry.expires > now);

        // LRU eviction
        if merged.len() > self.max_entries {
            merged.sort_by(|a, b| {
                a.last_used
                    .partial_cmp(&b.last_used)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let evicted = merged.len() - self.max_entries;
            merged.drain(..evicted);
            log::warn!("LRU evicted {evicted} cookies for {domain}");
        }

        if let Err(err) = self.write_atomic(domain, &merged) {
            log::warn!("Failed to write cookies for {domain}: {err}");
        }
    }

    /// Parse raw Set-Cookie header lines and save them.
    pub fn save_from_headers(&self, domain: &str, raw_values: &[String], url: &str) {
        let now = now_epoch();
        let cookies: Vec<CookieEntry> = raw_values
            .iter()
            .filter_map(|raw| {
                let name = parse_cookie_name(raw)?;
                Some(CookieEntry {
                    name: name.to_string(),
                    raw: raw.clone(),
                    url: url.to_string(),
                    expires: parse_cookie_expires(raw, now),
                    last_used: now,
                })
            })
            .collect();
        if !cookies.is_empty() {
            let count = cookies.len();
            self.save(domain, cookies);
            log::debug!("Cached {count} cookies for {domain}");
        }
    }

    /// Delete the cookie cache file for a domain.
    pub fn clear(&self, domain: &str) {
        let path = self.domain_path(domain);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to clear cookies for {domain}: {err}");
            }
        }
    }

    /// List all domains with a cache file.
    pub fn list_domains(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Delete domain files not touched in 24h whose cookies have all
    /// expired.
    fn sweep_expired(&self, now: f64) {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if file_age_secs(&path, now).is_none_or(|age| age < STALE_FILE_SECS) {
                continue;
            }
            let Ok(data) = fs::read_to_string(&path) else {
                continue;
            };
            let parsed: Result<Vec<CookieEntry>, _> = serde_json::from_str(&data);
            let delete = match parsed {
                Ok(cookies) => {
                    cookies.is_empty() || !cookies.iter().any(|c| c.expires > now)
                }
                // Non-list or corrupt file: remove
                Err(_) => true,
            };
            if delete {
                let _ = fs::remove_file(&path);
                log::debug!("Swept expired cookie file: {}", path.display());
            }
        }
    }

    /// Atomic write: temp file + rename (same directory, so the rename is
    /// atomic on POSIX).
    fn write_atomic(&self, domain: &str, entries: &[CookieEntry]) -> std::io::Result<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let path = self.domain_path(domain);
        let tmp_path = path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(entries)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        if let Err(err) = fs::write(&tmp_path, payload).and_then(|_| fs::rename(&tmp_path, &path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }
}

fn file_age_secs(path: &Path, now: f64) -> Option<f64> {
    let mtime = fs::metadata(path).ok()?.modified().ok()?;
    let epoch = mtime.duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
    Some(now - epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, expires: f64, last_used: f64) -> CookieEntry {
        CookieEntry {
            name: name.to_string(),
            raw: format!("{name}=value; Path=/"),
            url: "https://example.com/".to_string(),
            expires,
            last_used,
        }
    }

    #[test]
    fn round_trip_filters_session_and_expired() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        let now = now_epoch();

        cache.save(
            "example.com",
            vec![
                entry("persistent", now + 3600.0, now),
                entry("session", 0.0, now),
                entry("expired", now - 10.0, now),
            ],
        );

        let loaded = cache.load("example.com");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "persistent");
        assert!(loaded[0].last_used >= now);
    }

    #[test]
    fn merge_is_latest_wins_by_name() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        let now = now_epoch();

        cache.save("example.com", vec![entry("token", now + 100.0, now)]);
        let mut updated = entry("token", now + 9000.0, now);
        updated.raw = "token=fresh; Path=/".to_string();
        cache.save("example.com", vec![updated]);

        let loaded = cache.load("example.com");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].raw, "token=fresh; Path=/");
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path()).with_max_entries(2);
        let now = now_epoch();

        cache.save(
            "example.com",
            vec![
                entry("oldest", now + 3600.0, now - 300.0),
                entry("newer", now + 3600.0, now - 100.0),
                entry("newest", now + 3600.0, now),
            ],
        );

        let mut names: Vec<String> = cache
            .load("example.com")
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["newer", "newest"]);
    }

    #[test]
    fn save_from_headers_parses_max_age_and_expires() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        let now = now_epoch();

        cache.save_from_headers(
            "example.com",
            &[
                "durable=1; Max-Age=3600; Path=/".to_string(),
                // Max-Age wins over Expires
                "both=1; Max-Age=7200; Expires=Sun, 06 Nov 1994 08:49:37 GMT".to_string(),
                "dated=1; Expires=Sun, 06 Nov 2094 08:49:37 GMT".to_string(),
                "session=1; Path=/".to_string(),
            ],
            "https://example.com/",
        );

        let loaded = cache.load("example.com");
        let by_name: HashMap<String, CookieEntry> =
            loaded.into_iter().map(|e| (e.name.clone(), e)).collect();
        assert!(by_name["durable"].expires > now + 3500.0);
        assert!(by_name["both"].expires > now + 7100.0);
        assert!(by_name["dated"].expires > now);
        assert!(!by_name.contains_key("session"));
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join("bad.com.json"), "{not json").unwrap();
        assert!(cache.load("bad.com").is_empty());

        fs::write(dir.path().join("obj.com.json"), "{\"a\": 1}").unwrap();
        assert!(cache.load("obj.com").is_empty());
    }

    #[test]
    fn clear_and_list_domains() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        let now = now_epoch();

        cache.save("a.com", vec![entry("x", now + 100.0, now)]);
        cache.save("b.com", vec![entry("y", now + 100.0, now)]);
        let mut domains = cache.list_domains();
        domains.sort();
        assert_eq!(domains, vec!["a.com", "b.com"]);

        cache.clear("a.com");
        assert_eq!(cache.list_domains(), vec!["b.com"]);
        // idempotent
        cache.clear("a.com");
    }

    #[test]
    fn domain_names_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        let path = cache.domain_path("evil.com/../../etc:passwd");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "evil.com_.._.._etc_passwd.json");
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let cache = CookieCache::new(dir.path());
        let now = now_epoch();
        cache.save("example.com", vec![entry("x", now + 100.0, now)]);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
