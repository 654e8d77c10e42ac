use sha2::{Digest, Sha256};

pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Salted SHA-256 used for ip/user-agent fingerprints; raw values are never stored.
pub fn salted_hash(salt: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Values accepted as "yes" in boolean-ish request headers.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on" | "y")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_hash_depends_on_salt() {
        assert_ne!(salted_hash("a", "10.0.0.1"), salted_hash("b", "10.0.0.1"));
        assert_eq!(salted_hash("a", "10.0.0.1"), salted_hash("a", "10.0.0.1"));
        assert_eq!(salted_hash("a", "x").len(), 64);
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "YES", " on ", "y"] {
            assert!(is_truthy(v), "{v} should be truthy");
        }
        for v in ["0", "false", "", "nope", "2"] {
            assert!(!is_truthy(v), "{v} should not be truthy");
        }
    }
}
