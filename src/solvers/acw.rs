//! ACW SC V2 solver (Alibaba Cloud WAF).
//!
//! The challenge page carries obfuscated JS, but after deobfuscation the
//! shuffle table and XOR key are identical across all deployments: extract
//! `arg1`, shuffle, XOR.

use once_cell::sync::Lazy;
use regex::Regex;

/// `output[i] = arg1[SHUFFLE[i] - 1]` (1-based positions).
const ACW_SHUFFLE: [usize; 40] = [
    15, 35, 29, 24, 33, 16, 1, 38, 10, 9, 19, 31, 40, 27, 22, 23, 25, 13, 6, 11, 39, 18, 20, 8,
    14, 21, 32, 26, 2, 30, 7, 4, 17, 5, 3, 28, 34, 37, 12, 36,
];

const ACW_KEY: &str = "3000176000856006061501533003690027800375";

static ARG1_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"var\s+arg1\s*=\s*'([0-9A-Fa-f]+)'").expect("arg1 regex"));

/// Solve an ACW challenge body. Returns the `acw_sc__v2` cookie value
/// (40 hex chars), or `None` if extraction fails.
pub fn solve_acw(body: &str) -> Option<String> {
    let arg1 = ARG1_RE.captures(body)?.get(1)?.as_str();
    let chars: Vec<char> = arg1.chars().collect();
    let max_pos = *ACW_SHUFFLE.iter().max().expect("non-empty table");
    if chars.len() < max_pos {
        return None;
    }

    let shuffled: String = ACW_SHUFFLE.iter().map(|pos| chars[pos - 1]).collect();

    // XOR hex pairs with the fixed key
    let mut result = String::with_capacity(ACW_KEY.len());
    let limit = shuffled.len().min(ACW_KEY.len());
    let mut i = 0;
    while i + 2 <= limit {
        let lhs = u8::from_str_radix(&shuffled[i..i + 2], 16).ok()?;
        let rhs = u8::from_str_radix(&ACW_KEY[i..i + 2], 16).ok()?;
        result.push_str(&format!("{:02x}", lhs ^ rhs));
        i += 2;
    }
    Some(result)
}
