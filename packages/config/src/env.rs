// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed lookups with defaults, range validation and warnings for bad values

use std::str::FromStr;
use tracing::warn;

/// Parse an environment variable, falling back to `default` when unset or unparseable.
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable and check it with `validator`.
///
/// A variable that is set but fails to parse or validate produces a warning and the
/// default is used instead. An unset variable silently yields the default.
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    let Ok(raw_value) = std::env::var(var_name) else {
        return default;
    };

    match raw_value.trim().parse::<T>() {
        Ok(parsed) if validator(parsed) => parsed,
        Ok(_) => {
            warn!(
                "Environment variable {} has invalid value '{}', using default: {}",
                var_name, raw_value, default
            );
            default
        }
        Err(_) => {
            warn!(
                "Environment variable {} has unparseable value '{}', using default: {}",
                var_name, raw_value, default
            );
            default
        }
    }
}

/// Read a string variable, treating empty or whitespace-only values as unset.
pub fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a string variable with a default.
pub fn env_string_or(var_name: &str, default: &str) -> String {
    env_string(var_name).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_parse_env_or_default_not_set() {
        std::env::remove_var("APPFORGE_TEST_UNSET");
        let result: u16 = parse_env_or_default("APPFORGE_TEST_UNSET", 3100);
        assert_eq!(result, 3100);
    }

    #[test]
    #[serial]
    fn test_parse_env_or_default_trims_whitespace() {
        std::env::set_var("APPFORGE_TEST_TRIM", " 42 ");
        let result: u64 = parse_env_or_default("APPFORGE_TEST_TRIM", 7);
        assert_eq!(result, 42);
        std::env::remove_var("APPFORGE_TEST_TRIM");
    }

    #[test]
    #[serial]
    fn test_validation_accepts_in_range() {
        std::env::set_var("APPFORGE_TEST_RANGE_OK", "5");
        let result = parse_env_or_default_with_validation("APPFORGE_TEST_RANGE_OK", 3u32, |v| {
            (1..=10).contains(&v)
        });
        assert_eq!(result, 5);
        std::env::remove_var("APPFORGE_TEST_RANGE_OK");
    }

    #[test]
    #[serial]
    fn test_validation_rejects_out_of_range() {
        std::env::set_var("APPFORGE_TEST_RANGE_BAD", "0");
        let result = parse_env_or_default_with_validation("APPFORGE_TEST_RANGE_BAD", 3u32, |v| {
            (1..=10).contains(&v)
        });
        assert_eq!(result, 3);
        std::env::remove_var("APPFORGE_TEST_RANGE_BAD");
    }

    #[test]
    #[serial]
    fn test_validation_rejects_garbage() {
        std::env::set_var("APPFORGE_TEST_GARBAGE", "lots");
        let result = parse_env_or_default_with_validation("APPFORGE_TEST_GARBAGE", 9u16, |_| true);
        assert_eq!(result, 9);
        std::env::remove_var("APPFORGE_TEST_GARBAGE");
    }

    #[test]
    #[serial]
    fn test_env_string_treats_blank_as_unset() {
        std::env::set_var("APPFORGE_TEST_BLANK", "   ");
        assert_eq!(env_string("APPFORGE_TEST_BLANK"), None);
        assert_eq!(env_string_or("APPFORGE_TEST_BLANK", "npm install"), "npm install");
        std::env::remove_var("APPFORGE_TEST_BLANK");
    }
}
