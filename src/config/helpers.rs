use std::str::FromStr;

use crate::error::ConfigError;

/// Read an environment variable, treating unset and empty the same.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "not valid unicode".to_string(),
        }),
    }
}

/// Look up `key` and parse it, falling back to `default` when absent.
pub(crate) fn parse_lookup<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Result<Option<String>, ConfigError>,
{
    match lookup(key)? {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

/// Interpret a flag variable. Any non-empty value other than an explicit
/// negative counts as set.
pub(crate) fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
pub(crate) fn lookup_from(
    pairs: &[(&str, &str)],
) -> impl Fn(&str) -> Result<Option<String>, ConfigError> + use<> {
    let map: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| Ok(map.get(key).filter(|v| !v.is_empty()).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_truthy() {
        for v in ["1", "true", "TRUE", "yes", "on", "anything"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["", "0", "false", "No", "off", "  "] {
            assert!(!is_truthy(v), "{v:?} should not be truthy");
        }
    }

    #[test]
    fn test_parse_lookup_default_and_error() {
        let lookup = lookup_from(&[("PORT", "6543"), ("BAD", "sixty")]);

        assert_eq!(parse_lookup(&lookup, "PORT", 5432u16).unwrap(), 6543);
        assert_eq!(parse_lookup(&lookup, "MISSING", 5432u16).unwrap(), 5432);

        let err = parse_lookup(&lookup, "BAD", 5432u16).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "BAD"));
    }
}
