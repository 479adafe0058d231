//! Environment helpers shared by the per-app `config.rs` files.

pub fn string(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

pub fn int(key: &str, fallback: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(fallback)
}

pub fn boolean(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => fallback,
    }
}

/// Comma-separated list; entries are trimmed, de-duplicated, and empties
/// dropped. Falls back when the variable is unset or yields nothing.
pub fn csv(key: &str, fallback: &[&str]) -> Vec<String> {
    let raw = std::env::var(key).unwrap_or_default();
    let mut seen = std::collections::HashSet::new();
    let parsed: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect();
    if parsed.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_dedupes_and_trims() {
        std::env::set_var("SHOAL_TEST_CSV", " a, b ,a,, ");
        assert_eq!(csv("SHOAL_TEST_CSV", &["x"]), vec!["a", "b"]);
        std::env::remove_var("SHOAL_TEST_CSV");
        assert_eq!(csv("SHOAL_TEST_CSV", &["x"]), vec!["x"]);
    }

    #[test]
    fn int_rejects_non_positive() {
        std::env::set_var("SHOAL_TEST_INT", "-4");
        assert_eq!(int("SHOAL_TEST_INT", 7), 7);
        std::env::set_var("SHOAL_TEST_INT", "12");
        assert_eq!(int("SHOAL_TEST_INT", 7), 12);
        std::env::remove_var("SHOAL_TEST_INT");
    }
}
