//! Logging façade.
//!
//! `rd` wraps its log sink behind a `log!(LogLevel::LogDebug, ...)` call-site
//! idiom; we keep that call-site shape but back it with the ordinary `log`
//! facade crate instead of `rd`'s own trace-aware sink, since that sink is
//! part of the session/trace machinery this crate doesn't carry over. Binary
//! entry points call [`init`] once; library code never initializes a logger
//! itself.

/// Install an `env_logger` subscriber reading `RUST_LOG` (default `info`).
///
/// Idempotent: safe to call more than once (e.g. from multiple test
/// harnesses), subsequent calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(false)
        .try_init();
}
