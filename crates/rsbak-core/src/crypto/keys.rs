//! Password-based key derivation and the salt→key cache.
//!
//! Keys are derived with PBKDF2-HMAC-SHA1 from the user's password and a
//! 16-byte salt stored in each frame. Deriving a key is deliberately
//! expensive (100,000 iterations); since the derivation is a pure function
//! of `(password, salt)`, results are cached for the lifetime of a
//! [`SaltKeyCache`] so decrypting thousands of blobs against the same vault
//! only pays the PBKDF2 cost once per distinct salt.

use std::fmt;

use dashmap::DashMap;
use zeroize::Zeroizing;

use super::{PBKDF2_ITERATIONS, SALT_LEN};

/// Derived AES-128 key material, zeroized on drop.
pub type DerivedKey = Zeroizing<[u8; 16]>;

/// A cache mapping `(password, salt)` to its derived key.
///
/// Entries are immutable once inserted — the derivation is a pure
/// function — so reads never need to invalidate anything. Implementations
/// must be safe to share across worker threads via `Arc`.
pub trait KeyCache: Send + Sync {
    /// Return the cached key for `(password, salt)`, deriving and
    /// inserting it on first use.
    fn get_or_derive(&self, password: &str, salt: [u8; SALT_LEN]) -> DerivedKey;
}

/// The default [`KeyCache`]: a lock-free map of salt to derived key.
///
/// Keyed only on salt, not on `(password, salt)`: in practice one
/// [`SaltKeyCache`] instance is used for a single backup/restore session
/// against a single password, so every lookup shares the same password and
/// the salt alone is a sufficient cache key.
#[derive(Default)]
pub struct SaltKeyCache {
    entries: DashMap<[u8; SALT_LEN], DerivedKey>,
}

impl fmt::Debug for SaltKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaltKeyCache")
            .field("cached_salts", &self.entries.len())
            .finish()
    }
}

impl SaltKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct salts derived so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyCache for SaltKeyCache {
    fn get_or_derive(&self, password: &str, salt: [u8; SALT_LEN]) -> DerivedKey {
        if let Some(existing) = self.entries.get(&salt) {
            return existing.clone();
        }
        let derived = derive_key(password, &salt);
        self.entries.entry(salt).or_insert(derived).clone()
    }
}

/// Derive a 16-byte AES key from `password` and `salt` via PBKDF2-HMAC-SHA1.
pub fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> DerivedKey {
    let mut key = [0u8; 16];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    Zeroizing::new(key)
}
