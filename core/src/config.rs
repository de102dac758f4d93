//! Environment-style configuration lookups.
//!
//! Configuration arrives as string key/value pairs (process environment, `.env` file,
//! or a test map). The helpers here turn a lookup function into typed values and
//! report exactly which key was missing or malformed.
//!
//! Empty values are treated the same as absent ones.

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key was absent or empty.
    #[error("Missing required configuration key: {0}")]
    Missing(String),

    /// A key was present but could not be parsed.
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        /// The offending key
        key: String,
        /// Why the value was rejected
        reason: String,
    },
}

/// Read an optional key, treating empty values as absent.
pub fn optional<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|value| !value.trim().is_empty())
}

/// Read a required key.
///
/// # Errors
///
/// Returns [`ConfigError::Missing`] if the key is absent or empty.
pub fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    optional(lookup, key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

/// Read and parse an optional key, falling back to `default` when absent.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if the key is present but does not parse.
pub fn parsed_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match optional(lookup, key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_values_count_as_missing() {
        let lookup = lookup_from(&[("NAME", "  ")]);
        assert_eq!(
            required(&lookup, "NAME"),
            Err(ConfigError::Missing("NAME".to_string()))
        );
    }

    #[test]
    fn parsed_or_uses_default_when_absent() {
        let lookup = lookup_from(&[]);
        assert_eq!(parsed_or(&lookup, "PORT", 5432_u16), Ok(5432));
    }

    #[test]
    fn parsed_or_rejects_garbage() {
        let lookup = lookup_from(&[("PORT", "fifty")]);
        let err = parsed_or(&lookup, "PORT", 5432_u16).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "PORT"));
    }
}
