//! Environment variable helpers used by the config layers
//!
//! ```ignore
//! use netconn_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let sockets: usize = env_get("NETCONN_NUM_SOCKETS", 16);
//! let duplex = env_get_bool("NETCONN_FULL_DUPLEX", true);
//! let tick = env_get_ms("NETCONN_SLOW_TIMER_MS", 500);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or invalid.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Boolean variable: "1", "true", "yes", "on" (any case) are true,
/// any other value is false, unset gives `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Millisecond variable as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Optional millisecond variable; `0` and `off` mean "no value".
pub fn env_get_opt_ms(key: &str, default: Option<Duration>) -> Option<Duration> {
    match std::env::var(key) {
        Ok(val) if val.eq_ignore_ascii_case("off") => None,
        Ok(val) => match val.trim().parse::<u64>() {
            Ok(0) => None,
            Ok(ms) => Some(Duration::from_millis(ms)),
            Err(_) => default,
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__NETCONN_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__NETCONN_TEST_UNSET__", true));
        assert!(env_get_opt::<u16>("__NETCONN_TEST_UNSET__").is_none());
    }

    #[test]
    fn test_env_get_set_and_invalid() {
        std::env::set_var("__NETCONN_TEST_NUM__", " 123 ");
        let val: usize = env_get("__NETCONN_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__NETCONN_TEST_NUM__", "many");
        let val: usize = env_get("__NETCONN_TEST_NUM__", 9);
        assert_eq!(val, 9);
        std::env::remove_var("__NETCONN_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__NETCONN_TEST_BOOL__", "ON");
        assert!(env_get_bool("__NETCONN_TEST_BOOL__", false));
        std::env::set_var("__NETCONN_TEST_BOOL__", "0");
        assert!(!env_get_bool("__NETCONN_TEST_BOOL__", true));
        std::env::set_var("__NETCONN_TEST_BOOL__", "garbage");
        assert!(!env_get_bool("__NETCONN_TEST_BOOL__", true));
        std::env::remove_var("__NETCONN_TEST_BOOL__");
    }

    #[test]
    fn test_env_ms() {
        assert_eq!(env_get_ms("__NETCONN_TEST_MS_UNSET__", 250), Duration::from_millis(250));

        std::env::set_var("__NETCONN_TEST_OPT_MS__", "off");
        assert_eq!(env_get_opt_ms("__NETCONN_TEST_OPT_MS__", Some(Duration::from_secs(1))), None);
        std::env::set_var("__NETCONN_TEST_OPT_MS__", "1500");
        assert_eq!(
            env_get_opt_ms("__NETCONN_TEST_OPT_MS__", None),
            Some(Duration::from_millis(1500))
        );
        std::env::remove_var("__NETCONN_TEST_OPT_MS__");
    }
}
