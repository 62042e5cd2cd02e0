//! Short content hashes used as task identifiers.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use sha2::{Digest, Sha256};

/// Length of a task id.
pub const TASK_ID_LEN: usize = 8;

/// First `len` characters of the URL-safe base64 SHA-256 of `input`.
///
/// `len` is capped at the 44 characters of the full encoding.
///
/// ```
/// use vault_scheduler::util::hash::short_hash;
///
/// let a = short_hash("echo:1", 8);
/// assert_eq!(a.len(), 8);
/// assert_eq!(a, short_hash("echo:1", 8));
/// assert_ne!(a, short_hash("echo:2", 8));
/// ```
#[must_use]
pub fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = URL_SAFE.encode(digest);
    encoded.truncate(len);
    encoded
}

/// Task id for a metadata dedup string.
///
/// With `salt` set the id differs per call, letting duplicates of a unique
/// job coexist in the live index.
#[must_use]
pub fn task_id(meta_string: &str, salt: Option<(u128, u64)>) -> String {
    match salt {
        None => short_hash(meta_string, TASK_ID_LEN),
        Some((nanos, seq)) => short_hash(&format!("{meta_string}{nanos}:{seq}"), TASK_ID_LEN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_is_url_safe() {
        for i in 0..256 {
            let id = short_hash(&format!("scan_file:/photos/{i}.jpg"), TASK_ID_LEN);
            assert_eq!(id.len(), TASK_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_short_hash_caps_length() {
        assert_eq!(short_hash("x", 1000).len(), 44);
    }

    #[test]
    fn test_salted_ids_differ() {
        let plain = task_id("echo:1", None);
        assert_eq!(plain, task_id("echo:1", None));
        assert_ne!(task_id("echo:1", Some((1, 0))), task_id("echo:1", Some((1, 1))));
        assert_ne!(plain, task_id("echo:1", Some((1, 0))));
    }
}
