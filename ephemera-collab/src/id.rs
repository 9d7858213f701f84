//! Short URL-safe public document identifiers.
//!
//! 10 characters drawn from a 54-character alphabet without look-alikes
//! (no `0/O`, `1/l/I`), roughly 2 × 10^17 combinations.

use rand::Rng;
use std::fmt;

const ALPHABET: &[u8] = b"23456789abcdefghjkmnpqrstuvwxyzABCDEFGHJKMNPQRSTUVWXYZ";
const ID_LENGTH: usize = 10;

/// A validated public document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id = (0..ID_LENGTH)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Validate an identifier taken from a URL.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != ID_LENGTH || !raw.bytes().all(|b| ALPHABET.contains(&b)) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_valid() {
        for _ in 0..100 {
            let id = DocumentId::generate();
            assert_eq!(id.as_str().len(), ID_LENGTH);
            assert_eq!(DocumentId::parse(id.as_str()), Some(id));
        }
    }

    #[test]
    fn test_rejects_ambiguous_characters() {
        assert!(DocumentId::parse("abcdefghj0").is_none());
        assert!(DocumentId::parse("abcdefghjO").is_none());
        assert!(DocumentId::parse("abcdefghjl").is_none());
        assert!(DocumentId::parse("abcdefghjI").is_none());
        assert!(DocumentId::parse("abcdefghj1").is_none());
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(DocumentId::parse("").is_none());
        assert!(DocumentId::parse("abc").is_none());
        assert!(DocumentId::parse("abcdefghjkm").is_none());
        assert!(DocumentId::parse("abcdefghjk").is_some());
    }

    #[test]
    fn test_ids_differ() {
        assert_ne!(DocumentId::generate(), DocumentId::generate());
    }
}
