//! Opaque user identities.
//!
//! The ledger never sees a raw platform identity. Front ends derive a
//! [`UserHash`] with a keyed HMAC-SHA256 and pass only the hex digest in.
//! Anything that reaches the ledger as a string goes through
//! [`UserHash::parse`], which normalises case and rejects malformed input.

use std::fmt;

use ring::hmac;

/// Shortest accepted hash (hex chars). Also the admin heuristic: anything
/// shorter is treated as a raw identity.
pub const MIN_HASH_LEN: usize = 16;
/// Longest accepted hash (hex chars).
pub const MAX_HASH_LEN: usize = 128;

/// Lowercase hex digest identifying one end user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserHash(String);

impl UserHash {
    /// Parse an externally supplied hash.
    ///
    /// Trims whitespace and lowercases; returns `None` unless the result is
    /// 16..=128 hex characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim().to_ascii_lowercase();
        if s.len() < MIN_HASH_LEN || s.len() > MAX_HASH_LEN {
            return None;
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(s))
    }

    /// Derive the hash of a raw platform identity: `hex(HMAC-SHA256(secret, raw))`.
    pub fn derive(secret: &str, raw_identity: &str) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let tag = hmac::sign(&key, raw_identity.as_bytes());
        Self(hex::encode(tag.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for UserHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolve an operator-supplied identifier: a 16+ char hex string is taken as
/// a hash, anything else is treated as a raw identity and hashed.
pub fn resolve_identifier(secret: &str, ident: &str) -> UserHash {
    let trimmed = ident.trim();
    if trimmed.len() >= MIN_HASH_LEN {
        if let Some(hash) = UserHash::parse(trimmed) {
            return hash;
        }
    }
    UserHash::derive(secret, trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic_and_hex() {
        let a = UserHash::derive("salt", "905244203");
        let b = UserHash::derive("salt", "905244203");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(UserHash::parse(a.as_str()).is_some());
    }

    #[test]
    fn test_derive_depends_on_secret() {
        let a = UserHash::derive("salt-a", "42");
        let b = UserHash::derive("salt-b", "42");
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_matches_known_hmac_vector() {
        // RFC 4231 test case 2.
        let h = UserHash::derive("Jefe", "what do ya want for nothing?");
        assert_eq!(
            h.as_str(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_parse_normalises_case_and_whitespace() {
        let h = UserHash::parse("  ABCDEF0123456789ABCDEF  ").unwrap();
        assert_eq!(h.as_str(), "abcdef0123456789abcdef");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(UserHash::parse("").is_none());
        assert!(UserHash::parse("abc").is_none());
        assert!(UserHash::parse("zzzzzzzzzzzzzzzzzzzz").is_none());
        assert!(UserHash::parse(&"a".repeat(129)).is_none());
        assert!(UserHash::parse("0123456789abcdef; DROP TABLE users").is_none());
    }

    #[test]
    fn test_short_is_prefix() {
        let h = UserHash::parse("0123456789abcdef").unwrap();
        assert_eq!(h.short(), "01234567");
    }

    #[test]
    fn test_resolve_identifier_hash_or_raw() {
        let hash = "0123456789abcdef0123";
        assert_eq!(resolve_identifier("s", hash).as_str(), hash);

        let raw = resolve_identifier("s", "905244203");
        assert_eq!(raw, UserHash::derive("s", "905244203"));
    }
}
