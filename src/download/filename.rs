// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use sha2::{Digest, Sha256};

/// Maximum length of the readable portion of a filename
const MAX_STEM_LENGTH: usize = 96;

/// Number of hex digits of the identity hash appended to every filename
const HASH_LENGTH: usize = 16;

/// Character substituted for anything illegal in a path
const REPLACEMENT: &str = "_";

/// Compute the download filename for an episode identity.
///
/// Format: `<sanitized identity>-<16 hex digits of sha256(identity)>.<ext>`.
/// The readable part is for humans; the hash keeps identities apart that
/// sanitize to the same text (`a/b` and `a:b`, or long guids sharing a prefix).
pub fn storage_filename(identity: &str, extension: &str) -> String {
    format!(
        "{}-{}.{}",
        sanitize_identity(identity),
        identity_hash(identity),
        normalize_extension(extension)
    )
}

/// Replace characters that are illegal in a file name, each with a single `_`
fn sanitize_identity(identity: &str) -> String {
    let options = sanitize_filename::Options {
        windows: true,
        truncate: true,
        replacement: REPLACEMENT,
    };
    // Control characters and whitespace are legal on most systems but make
    // for miserable file names
    let flattened: String = identity
        .chars()
        .map(|c| if c.is_whitespace() || c.is_control() { '_' } else { c })
        .collect();
    let sanitized = sanitize_filename::sanitize_with_options(flattened, options);

    truncate_at_char_boundary(&sanitized, MAX_STEM_LENGTH)
        .trim_matches('.')
        .to_string()
}

fn identity_hash(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let mut hex = String::with_capacity(HASH_LENGTH);
    for byte in digest.iter().take(HASH_LENGTH / 2) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn truncate_at_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Lowercase ASCII alphanumerics only; falls back to `mp3`
fn normalize_extension(extension: &str) -> String {
    let normalized: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if normalized.is_empty() {
        "mp3".to_string()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_deterministic() {
        let a = storage_filename("7-episode-42", "mp3");
        let b = storage_filename("7-episode-42", "mp3");
        assert_eq!(a, b);
    }

    #[test]
    fn filename_has_readable_stem_and_hash() {
        let name = storage_filename("7-episode-42", "mp3");
        assert!(name.starts_with("7-episode-42-"));
        assert!(name.ends_with(".mp3"));
        // stem + "-" + hash + ".mp3"
        assert_eq!(name.len(), "7-episode-42".len() + 1 + HASH_LENGTH + 4);
    }

    #[test]
    fn identities_that_sanitize_alike_do_not_collide() {
        let slash = storage_filename("1-a/b", "mp3");
        let colon = storage_filename("1-a:b", "mp3");
        assert_ne!(slash, colon);
        assert!(slash.starts_with("1-a_b-"));
        assert!(colon.starts_with("1-a_b-"));
    }

    #[test]
    fn url_guids_become_flat_names() {
        let name = storage_filename("3-https://example.com/feed/ep?id=9", "mp3");
        assert!(!name.contains('/'));
        assert!(!name.contains('?'));
        assert!(!name.contains(':'));
    }

    #[test]
    fn whitespace_and_control_chars_are_replaced() {
        let name = storage_filename("1-line one\ttab\n", "mp3");
        assert!(!name.contains(' '));
        assert!(!name.contains('\t'));
        assert!(!name.contains('\n'));
    }

    #[test]
    fn long_identities_are_truncated_but_distinct() {
        let base = "x".repeat(300);
        let a = storage_filename(&format!("1-{base}a"), "mp3");
        let b = storage_filename(&format!("1-{base}b"), "mp3");
        assert_ne!(a, b);
        assert!(a.len() <= MAX_STEM_LENGTH + 1 + HASH_LENGTH + 4);
    }

    #[test]
    fn truncation_respects_multibyte_chars() {
        let identity = format!("1-{}", "é".repeat(100));
        let name = storage_filename(&identity, "mp3");
        assert!(name.ends_with(".mp3"));
    }

    #[test]
    fn extension_is_normalized() {
        assert!(storage_filename("1-a", ".M4A").ends_with(".m4a"));
        assert!(storage_filename("1-a", "").ends_with(".mp3"));
        assert!(storage_filename("1-a", "../x").ends_with(".x"));
    }

    #[test]
    fn dots_only_identity_is_not_a_relative_path() {
        let name = storage_filename("..", "mp3");
        assert!(!name.starts_with(".."));
    }
}
