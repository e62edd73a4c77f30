//! Inline challenge solvers — pure transforms, no browser needed.
//!
//! - ACW: Alibaba Cloud WAF — shuffle + XOR (~1ms)
//! - Amazon: rate-limit captcha — form parsing, submitted by the engine
//! - TMD: Alibaba TMD — session warming via homepage fetch
//!
//! Solvers are pure with respect to their body/URL inputs and idempotent
//! under retry; anything unparseable maps to `None` and the engine falls
//! back to rotation.

mod acw;
mod amazon;
mod tmd;

pub use acw::solve_acw;
pub use amazon::{AmazonSolveTarget, parse_amazon_captcha};
pub use tmd::tmd_homepage_url;
