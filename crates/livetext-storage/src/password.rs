//! Salted password hashing

use sha2::{Digest, Sha256};

/// Fresh random salt
pub fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Hex-encoded SHA-256 of `salt || password`
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Compare without short-circuiting on the first mismatch
pub fn verify_password(salt: &str, password: &str, expected: &str) -> bool {
    let actual = hash_password(salt, password);
    actual.len() == expected.len()
        && actual
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_salted() {
        let a = hash_password("salt-a", "hunter2");
        let b = hash_password("salt-b", "hunter2");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_verify() {
        let salt = new_salt();
        let hash = hash_password(&salt, "hunter2");
        assert!(verify_password(&salt, "hunter2", &hash));
        assert!(!verify_password(&salt, "hunter3", &hash));
    }
}
