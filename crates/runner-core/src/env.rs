use std::str::FromStr;

/// Returns the variable's value when set and non-empty.
pub fn non_empty(name: &str) -> Option<String> {
    filter_non_empty(std::env::var(name).ok())
}

/// True when the variable is set to any non-empty value.
pub fn flag(name: &str) -> bool {
    non_empty(name).is_some()
}

/// Parses the variable when set and non-empty; unparsable values are
/// treated as unset.
pub fn parse<T: FromStr>(name: &str) -> Option<T> {
    parse_value(non_empty(name))
}

/// Comma-separated list variable, trimmed, empty entries dropped.
pub fn list(name: &str) -> Option<Vec<String>> {
    non_empty(name).map(|value| split_list(&value))
}

/// Debug verbosity from `DEBUG` or `MORPH_DEBUG`, clamped to `0..=3`
/// (disabled / basic / verbose / trace).
pub fn debug_level() -> u8 {
    parse::<u8>("DEBUG")
        .or_else(|| parse::<u8>("MORPH_DEBUG"))
        .unwrap_or(0)
        .min(3)
}

fn filter_non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_value<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
