//! Session-key derivation.
//!
//! The orchestrator maps caller identity onto a [`SessionKey`]; the store
//! treats the key as opaque.  Derivation is a pluggable policy so that
//! deployments can swap in their own isolation scheme without touching the
//! request path.

use std::fmt;

use sha2::{Digest, Sha256};

/// Identifies one conversation within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    /// Canonical storage key: `session:{user_id}:{session_id}`.
    pub fn storage_key(&self) -> String {
        format!("session:{}:{}", self.user_id, self.session_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

pub trait SessionKeyPolicy: Send + Sync {
    /// Derive the session key for a request; `user` is the OpenAI `user`
    /// field when the caller supplied one.
    fn derive(&self, user: Option<&str>) -> SessionKey;
}

/// Default policy: bucket the user identity into `session_{hash % modulus}`.
///
/// The small modulus deliberately collides distinct users into a bounded key
/// space, matching the upstream deployments this service fronts.  SHA-256 is
/// folded to a u64 so the bucket is stable across process restarts.
#[derive(Debug, Clone)]
pub struct UserHashPolicy {
    pub modulus: u64,
}

impl Default for UserHashPolicy {
    fn default() -> Self {
        Self { modulus: 10_000 }
    }
}

impl SessionKeyPolicy for UserHashPolicy {
    fn derive(&self, user: Option<&str>) -> SessionKey {
        let user_id = user.unwrap_or("default").to_owned();
        let digest = Sha256::digest(user_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(prefix) % self.modulus.max(1);
        SessionKey {
            user_id,
            session_id: format!("session_{bucket}"),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let policy = UserHashPolicy::default();
        let first = policy.derive(Some("alice"));
        let second = policy.derive(Some("alice"));
        assert_eq!(first, second);
        assert_eq!(first.user_id, "alice");
        assert!(first.session_id.starts_with("session_"));
    }

    #[test]
    fn bucket_stays_within_modulus() {
        let policy = UserHashPolicy { modulus: 100 };
        for user in ["a", "b", "carol", "dave@example.com"] {
            let key = policy.derive(Some(user));
            let bucket: u64 = key.session_id["session_".len()..].parse().unwrap();
            assert!(bucket < 100);
        }
    }

    #[test]
    fn missing_user_falls_back_to_default_identity() {
        let policy = UserHashPolicy::default();
        let key = policy.derive(None);
        assert_eq!(key.user_id, "default");
        assert_eq!(key, policy.derive(Some("default")));
    }
}
