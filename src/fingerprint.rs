//! Fingerprint management: profile selection, rotation, pinning, sec-ch-ua.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::transport::Emulation;

// ---------------------------------------------------------------------------
// sec-ch-ua GREASE algorithm (from Chromium source)
// https://source.chromium.org/chromium/chromium/src/+/main:
//   components/embedder_support/user_agent_utils.cc
// ---------------------------------------------------------------------------

const GREASY_CHARS: [char; 11] = [' ', '(', ':', '-', '.', '/', ')', ';', '=', '?', '_'];
const GREASED_VERSIONS: [&str; 3] = ["8", "99", "24"];
const BRAND_ORDER: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

fn greased_brand(seed: usize) -> (String, &'static str) {
    let char1 = GREASY_CHARS[seed % 11];
    let char2 = GREASY_CHARS[(seed + 1) % 11];
    (
        format!("Not{char1}A{char2}Brand"),
        GREASED_VERSIONS[seed % 3],
    )
}

fn shuffle_brands(seed: usize, brands: [(String, String); 3]) -> String {
    let order = BRAND_ORDER[seed % 6];
    let mut shuffled: [(String, String); 3] = Default::default();
    for (i, brand) in brands.into_iter().enumerate() {
        shuffled[order[i]] = brand;
    }
    shuffled
        .iter()
        .map(|(b, v)| format!("\"{b}\";v=\"{v}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generate a `sec-ch-ua` value matching Chrome's deterministic GREASE
/// algorithm, seeded by the major version:
/// - Brand name: `"Not" + char1 + "A" + char2 + "Brand"`
/// - Brand version: cycles through `["8", "99", "24"]`
/// - Brand order: the 3 brands shuffled via a permutation table
///   (`shuffled[order[i]] = brands[i]`)
pub fn generate_sec_ch_ua(major_version: u16) -> String {
    let seed = major_version as usize;
    let (grease_brand, grease_version) = greased_brand(seed);
    shuffle_brands(
        seed,
        [
            (grease_brand, grease_version.to_string()),
            ("Chromium".to_string(), major_version.to_string()),
            ("Google Chrome".to_string(), major_version.to_string()),
        ],
    )
}

// Chrome full version format: MAJOR.0.BUILD.PATCH
// Build numbers increment ~65 per major version from a known anchor.
const FULL_VERSION_ANCHOR: (i32, i32, i32) = (130, 6723, 91); // Chrome 130.0.6723.91

fn full_version(major: u16) -> String {
    let (anchor_major, anchor_build, anchor_patch) = FULL_VERSION_ANCHOR;
    let build = anchor_build + (major as i32 - anchor_major) * 65;
    format!("{major}.0.{build}.{anchor_patch}")
}

/// Generate `sec-ch-ua-full-version-list` with full version numbers, using
/// the same GREASE algorithm as [`generate_sec_ch_ua`].
pub fn generate_sec_ch_ua_full_version_list(major_version: u16) -> String {
    let seed = major_version as usize;
    let full = full_version(major_version);
    let (grease_brand, grease_version) = greased_brand(seed);
    shuffle_brands(
        seed,
        [
            (grease_brand, format!("{grease_version}.0.0.0")),
            ("Chromium".to_string(), full.clone()),
            ("Google Chrome".to_string(), full),
        ],
    )
}

// ---------------------------------------------------------------------------
// Host-derived hints (sec-ch-ua-platform, arch, bitness, platform-version).
// Real Chrome sends the high-entropy set after a site requests it via
// Accept-CH / Critical-CH; strict WAFs require it for cookie replay.
// Stable for the lifetime of the process.
// ---------------------------------------------------------------------------

static HOST_PLATFORM: Lazy<&'static str> = Lazy::new(|| match std::env::consts::OS {
    "macos" => "\"macOS\"",
    "linux" => "\"Linux\"",
    _ => "\"Windows\"",
});

static HOST_ARCH: Lazy<&'static str> = Lazy::new(|| match std::env::consts::ARCH {
    "aarch64" | "arm" => "\"arm\"",
    _ => "\"x86\"",
});

static HOST_BITNESS: Lazy<String> =
    Lazy::new(|| format!("\"{}\"", std::mem::size_of::<usize>() * 8));

static HOST_PLATFORM_VERSION: Lazy<String> = Lazy::new(|| {
    match std::env::consts::OS {
        "linux" => {
            // Chrome reports the kernel version on Linux
            let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
                .unwrap_or_default();
            let mut parts = release.trim().split('.');
            match (parts.next(), parts.next()) {
                (Some(major), Some(minor)) if !major.is_empty() => {
                    format!("\"{major}.{minor}.0\"")
                }
                _ => "\"6.0.0\"".to_string(),
            }
        }
        // Chrome reports the Darwin kernel version, not the marketing one
        "macos" => "\"24.0.0\"".to_string(),
        _ => "\"10.0.0\"".to_string(),
    }
});

static UA_CHROME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Chrome/(\d+)").expect("chrome UA regex"));

/// Extract the Chrome major version from a User-Agent string.
pub fn chrome_version_from_ua(user_agent: &str) -> Option<u16> {
    UA_CHROME_RE
        .captures(user_agent)
        .and_then(|caps| caps[1].parse().ok())
}

// ---------------------------------------------------------------------------
// FingerprintManager
// ---------------------------------------------------------------------------

/// Manages emulation profile selection, rotation on 403, and pinning.
#[derive(Debug, Clone)]
pub struct FingerprintManager {
    pool: Vec<Emulation>,
    current: Emulation,
    pinned: bool,
    rotation_index: usize,
}

impl FingerprintManager {
    /// Build from the profiles a transport factory advertises. Non-Chrome
    /// profiles are excluded from the rotation pool; the pool is kept
    /// newest-first.
    pub fn new(available: &[Emulation], initial: Option<Emulation>) -> Self {
        let mut pool: Vec<Emulation> = available.iter().copied().filter(Emulation::is_chrome).collect();
        pool.sort_by(|a, b| b.chrome_version().cmp(&a.chrome_version()));

        let current = initial
            .or_else(|| pool.first().copied())
            .unwrap_or(Emulation::Chrome(145));

        Self {
            pool,
            current,
            pinned: false,
            rotation_index: 0,
        }
    }

    pub fn current(&self) -> Emulation {
        self.current
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    /// Pin the current fingerprint (cookies are bound to this TLS identity).
    /// Idempotent; makes [`rotate`](Self::rotate) a no-op until reset.
    pub fn pin(&mut self) {
        if !self.pinned {
            self.pinned = true;
            log::debug!("Fingerprint pinned to {}", self.current);
        }
    }

    /// Rotate to a different Chrome profile, cycling through the pool while
    /// skipping the current one. No-op when pinned.
    pub fn rotate(&mut self) -> Emulation {
        if self.pinned {
            log::debug!("Fingerprint is pinned, skipping rotation");
            return self.current;
        }

        let candidates: Vec<Emulation> = self
            .pool
            .iter()
            .copied()
            .filter(|em| *em != self.current)
            .collect();
        if candidates.is_empty() {
            log::warn!("No alternative Chrome profiles for rotation");
            return self.current;
        }

        self.current = candidates[self.rotation_index % candidates.len()];
        self.rotation_index += 1;
        log::debug!("Rotated fingerprint to {}", self.current);
        self.current
    }

    /// Full identity reset: set `emulation` (or the newest profile), clear
    /// pinning, rewind the rotation cursor.
    pub fn reset(&mut self, emulation: Option<Emulation>) {
        self.current = emulation
            .or_else(|| self.pool.first().copied())
            .unwrap_or(self.current);
        self.pinned = false;
        self.rotation_index = 0;
        log::debug!("Fingerprint reset to {}", self.current);
    }

    /// Find the pool profile matching a Chrome major version.
    pub fn profile_for_version(&self, version: u16) -> Option<Emulation> {
        self.pool
            .iter()
            .copied()
            .find(|em| em.chrome_version() == Some(version))
    }

    /// Generate the nine client-hint headers for the current profile.
    ///
    /// Low-entropy hints (`sec-ch-ua`, `-mobile`, `-platform`) are what
    /// Chrome always sends; the high-entropy set is what it sends after an
    /// Accept-CH opt-in. Empty for non-Chrome profiles.
    pub fn sec_ch_ua_headers(&self) -> HashMap<String, String> {
        let Some(ver) = self.current.chrome_version() else {
            return HashMap::new();
        };
        HashMap::from([
            ("sec-ch-ua".to_string(), generate_sec_ch_ua(ver)),
            ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
            ("sec-ch-ua-platform".to_string(), HOST_PLATFORM.to_string()),
            ("sec-ch-ua-arch".to_string(), HOST_ARCH.to_string()),
            ("sec-ch-ua-bitness".to_string(), HOST_BITNESS.clone()),
            (
                "sec-ch-ua-full-version".to_string(),
                format!("\"{}\"", full_version(ver)),
            ),
            (
                "sec-ch-ua-full-version-list".to_string(),
                generate_sec_ch_ua_full_version_list(ver),
            ),
            ("sec-ch-ua-model".to_string(), "\"\"".to_string()),
            (
                "sec-ch-ua-platform-version".to_string(),
                HOST_PLATFORM_VERSION.clone(),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Vec<Emulation> {
        vec![
            Emulation::Chrome(143),
            Emulation::Chrome(145),
            Emulation::Chrome(133),
            Emulation::Safari(18),
        ]
    }

    #[test]
    fn defaults_to_newest_chrome() {
        let manager = FingerprintManager::new(&pool(), None);
        assert_eq!(manager.current(), Emulation::Chrome(145));
    }

    #[test]
    fn sec_ch_ua_matches_chromium_algorithm() {
        // v=133: chars 133%11=1 -> '(' and 134%11=2 -> ':', version 99,
        // order [0,2,1] puts Google Chrome second
        assert_eq!(
            generate_sec_ch_ua(133),
            r#""Not(A:Brand";v="99", "Google Chrome";v="133", "Chromium";v="133""#
        );
        assert_eq!(
            generate_sec_ch_ua(145),
            r#""Not:A-Brand";v="99", "Google Chrome";v="145", "Chromium";v="145""#
        );
    }

    #[test]
    fn full_version_list_uses_anchor() {
        assert_eq!(full_version(130), "130.0.6723.91");
        assert_eq!(full_version(133), "133.0.6918.91");
        let list = generate_sec_ch_ua_full_version_list(133);
        assert!(list.contains(r#""Chromium";v="133.0.6918.91""#), "{list}");
        assert!(list.contains(".0.0.0"), "{list}");
    }

    #[test]
    fn emits_all_nine_hints_for_chrome_only() {
        let manager = FingerprintManager::new(&pool(), None);
        let headers = manager.sec_ch_ua_headers();
        assert_eq!(headers.len(), 9);
        assert_eq!(headers["sec-ch-ua-mobile"], "?0");
        assert_eq!(headers["sec-ch-ua-model"], "\"\"");

        let safari = FingerprintManager::new(&pool(), Some(Emulation::Safari(18)));
        assert!(safari.sec_ch_ua_headers().is_empty());
    }

    #[test]
    fn rotation_skips_current_and_cycles() {
        let mut manager = FingerprintManager::new(&pool(), None);
        // pool: [145, 143, 133], current 145
        assert_eq!(manager.rotate(), Emulation::Chrome(143));
        assert_eq!(manager.rotate(), Emulation::Chrome(133));
        assert_eq!(manager.rotate(), Emulation::Chrome(145));
        // every step lands on a non-current pool member
        for _ in 0..6 {
            let previous = manager.current();
            let next = manager.rotate();
            assert_ne!(next, previous);
            assert!(next.is_chrome());
        }
    }

    #[test]
    fn pin_blocks_rotation_until_reset() {
        let mut manager = FingerprintManager::new(&pool(), None);
        manager.pin();
        assert!(manager.pinned());
        let before = manager.current();
        assert_eq!(manager.rotate(), before);
        manager.pin(); // idempotent
        manager.reset(None);
        assert!(!manager.pinned());
        assert_ne!(manager.rotate(), before);
    }

    #[test]
    fn reset_to_specific_profile() {
        let mut manager = FingerprintManager::new(&pool(), None);
        manager.reset(Some(Emulation::Chrome(133)));
        assert_eq!(manager.current(), Emulation::Chrome(133));
    }

    #[test]
    fn chrome_version_from_ua_strings() {
        assert_eq!(
            chrome_version_from_ua(
                "Mozilla/5.0 (Macintosh) AppleWebKit/537.36 Chrome/133.0.0.0 Safari/537.36"
            ),
            Some(133)
        );
        assert_eq!(
            chrome_version_from_ua("Mozilla/5.0 Version/18.0 Safari/605.1.15"),
            None
        );
    }
}
