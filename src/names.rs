//! Kubernetes-safe naming helpers

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Maximum length of a Kubernetes label value / DNS-1123 label
pub const MAX_NAME_LEN: usize = 63;

/// Random lowercase alphanumeric suffix of the given length.
///
/// Concurrent scenarios rely on this for release and workload name
/// uniqueness; there is no cross-process lock.
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

/// Sanitize an arbitrary string into a valid Kubernetes name / label value.
///
/// Lowercases, replaces anything outside `[a-z0-9-]` with `-`, collapses
/// dash runs, trims leading/trailing dashes and truncates to 63 chars.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches('-');
    let mut truncated: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_titles_become_label_values() {
        assert_eq!(sanitize("Agent connects to Node"), "agent-connects-to-node");
        assert_eq!(sanitize("  --Weird__Name!!  "), "weird-name");
        assert_eq!(sanitize("UPPER.case/with:stuff"), "upper-case-with-stuff");
    }

    #[test]
    fn long_names_are_truncated_without_trailing_dash() {
        let long = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let s = sanitize(&long);
        assert!(s.len() <= MAX_NAME_LEN);
        assert!(!s.ends_with('-'));
        assert_eq!(s, "a".repeat(62));
    }

    #[test]
    fn suffixes_are_lowercase_alphanumeric() {
        let s = random_suffix(10);
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(random_suffix(10), random_suffix(10));
    }
}
