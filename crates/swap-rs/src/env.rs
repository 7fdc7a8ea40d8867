use std::env;

/// Environment variable consulted by [`SwapConfig::from_env`](crate::config::SwapConfig::from_env).
pub const MEMORY_SWAPPING_VAR: &str = "SWAPRS_MEMORY_SWAPPING";

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn memory_swapping_requested() -> bool {
    match env::var(MEMORY_SWAPPING_VAR) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}
