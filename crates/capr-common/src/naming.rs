//! Derived object names and content hashes

use aws_lc_rs::digest::{digest, SHA256};

const HASH_LENGTH: usize = 6;

/// Maximum length of a Kubernetes object name
pub const MAX_NAME_LENGTH: usize = 63;

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex_encode(digest(&SHA256, data.as_ref()).as_ref())
}

/// Raw SHA-256 of `data`
pub fn sha256(data: impl AsRef<[u8]>) -> Vec<u8> {
    digest(&SHA256, data.as_ref()).as_ref().to_vec()
}

/// Lowercase hex encoding
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Join `parts` with `-`, keeping the result at most `max_length` bytes
///
/// Over-long names are truncated and suffixed with a short SHA-256 of the full
/// name so distinct inputs stay distinct. At `max_length <= 5` the name is
/// simply cut. The suffix is widened by one character when the cut would
/// leave a non-alphanumeric character before the `-` separator.
pub fn safe_concat_name(max_length: usize, parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= max_length {
        return full;
    }
    if max_length == 0 {
        return String::new();
    }
    if max_length <= 5 {
        return truncate_bytes(&full, max_length).to_string();
    }

    let hash = sha256_hex(&full);
    let trailing = max_length.saturating_sub(HASH_LENGTH + 1);
    let c = full.as_bytes()[trailing];

    if c.is_ascii_lowercase() || c.is_ascii_digit() {
        let remaining = truncate_bytes(&full, max_length - HASH_LENGTH);
        let hash = &hash[..HASH_LENGTH - 1];
        if remaining.is_empty() {
            return hash.to_string();
        }
        return format!("{remaining}-{hash}");
    }

    format!(
        "{}-{}",
        truncate_bytes(&full, max_length - (HASH_LENGTH + 1)),
        &hash[..HASH_LENGTH]
    )
}

/// Plan secret name for a bootstrap config
pub fn plan_secret_name(bootstrap_name: &str) -> String {
    safe_concat_name(MAX_NAME_LENGTH, &[bootstrap_name, "machine", "plan"])
}

/// Cluster state secret name for a control plane
pub fn cluster_state_secret_name(control_plane_name: &str) -> String {
    safe_concat_name(MAX_NAME_LENGTH, &[control_plane_name, "rke", "state"])
}

fn truncate_bytes(s: &str, len: usize) -> &str {
    let mut end = len.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_short_names_are_joined_verbatim() {
        assert_eq!(safe_concat_name(63, &["m1", "machine", "plan"]), "m1-machine-plan");
    }

    #[test]
    fn test_symbol_at_cut_point_widens_hash() {
        let name = safe_concat_name(8, &["a", "&", "b", "=", "c"]);
        assert!(name.len() <= 8);
        assert!(name.starts_with("a-"));
        assert_eq!(name.len(), 8);
        assert_eq!(&name[2..], &sha256_hex("a-&-b-=-c")[..6]);
    }

    #[test]
    fn test_alphanumeric_cut_keeps_extra_character() {
        let long = "abcdefghijklmnopqrstuvwxyz";
        let name = safe_concat_name(12, &[long]);
        assert_eq!(name.len(), 12);
        assert!(name.starts_with("abcdef-"));
        assert_eq!(&name[7..], &sha256_hex(long)[..5]);
    }

    #[rstest]
    #[case::zero(0, "")]
    #[case::tiny(3, "abc")]
    #[case::five(5, "abcde")]
    fn test_tiny_limits_truncate_without_hash(#[case] max: usize, #[case] expected: &str) {
        assert_eq!(safe_concat_name(max, &["abcdefgh", "ijk"]), expected);
    }

    #[test]
    fn test_results_are_deterministic_and_distinct() {
        let a = plan_secret_name(&"x".repeat(70));
        let b = plan_secret_name(&"y".repeat(70));
        assert_eq!(a, plan_secret_name(&"x".repeat(70)));
        assert_ne!(a, b);
        assert!(a.len() <= MAX_NAME_LENGTH);
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
