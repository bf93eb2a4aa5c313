//! Environment variable parsing helpers
//!
//! All tunables and log settings come through these; values are trimmed
//! before parsing so trailing whitespace in shell exports is harmless.

use std::str::FromStr;

/// The variable parsed as `T`, or `None` when unset or unparseable.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// The variable parsed as `T`, falling back to `default`.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Boolean variable: `1`, `true`, `yes` or `on` (case-insensitive) mean
/// true; any other set value means false; unset means `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
