//! Resource name helpers.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use tracing::warn;

static INVALID_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9-]+").unwrap());

/// Turn arbitrary input into a DNS-label-safe resource name.
///
/// Lowercases, collapses runs of invalid characters into `-` and trims
/// leading/trailing dashes. Empty results become `app`.
pub fn sanitize_name(input: &str) -> String {
    let lowered = input.to_lowercase();
    let replaced = INVALID_NAME_CHARS.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Random 8-hex-character suffix for generated resource names.
///
/// Reads the OS CSPRNG. Suffixes only need to be unique, so if the generator
/// is unavailable the current unix time is used instead.
pub fn random_suffix() -> String {
    let mut buf = [0u8; 4];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => hex::encode(buf),
        Err(e) => {
            warn!(error = %e, "OS random generator unavailable, using clock suffix");
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
                .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("DemoApp"), "demoapp");
        assert_eq!(sanitize_name("my_app v2"), "my-app-v2");
        assert_eq!(sanitize_name("--Weird__Name!!"), "weird-name");
        assert_eq!(sanitize_name("***"), "app");
        assert_eq!(sanitize_name(""), "app");
    }

    #[test]
    fn test_random_suffix_shape() {
        let a = random_suffix();
        let b = random_suffix();
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
