//! Environment variable utilities
//!
//! ```ignore
//! use vthread_core::env::{env_get, env_flag, env_millis};
//!
//! let carriers: usize = env_get("VT_PARALLELISM", 4);
//! let debug = env_flag("VT_DEBUG", false);
//! let slice = env_millis("VT_TIME_SLICE_MS", Duration::from_millis(10));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true,
/// "0", "false", "no", "off" are false, anything else yields `default`
#[inline]
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Whole milliseconds as a `Duration`
#[inline]
pub fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable name; tests run in parallel.

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__VT_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__VT_TEST_NUM__", " 123 ");
        let val: usize = env_get("__VT_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__VT_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__VT_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__VT_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__VT_TEST_INVALID__");
    }

    #[test]
    fn test_env_flag_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("off", false)] {
            std::env::set_var("__VT_TEST_FLAG__", raw);
            assert_eq!(env_flag("__VT_TEST_FLAG__", !expected), expected, "{}", raw);
        }
        std::env::set_var("__VT_TEST_FLAG__", "garbage");
        assert!(env_flag("__VT_TEST_FLAG__", true));
        std::env::remove_var("__VT_TEST_FLAG__");
        assert!(!env_flag("__VT_TEST_FLAG__", false));
    }

    #[test]
    fn test_env_millis() {
        assert_eq!(
            env_millis("__VT_TEST_UNSET_MS__", Duration::from_millis(7)),
            Duration::from_millis(7)
        );
        std::env::set_var("__VT_TEST_MS__", "250");
        assert_eq!(
            env_millis("__VT_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__VT_TEST_MS__");
    }
}
