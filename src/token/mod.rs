//! Tokens and token generators
//!
//! A token is a point on the 32-bit circular hash space. Each instance (or
//! partition) owns a set of tokens; ownership of a key is decided by binary
//! search over the sorted union of all tokens.

pub mod random;
pub mod spread;

pub use random::RandomTokenGenerator;
pub use spread::SpreadMinimizingTokenGenerator;

use crate::common::Result;
use crate::ring::model::RingDesc;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A point on the `[0, 2^32)` circular hash space.
pub type Token = u32;

/// A sorted, deduplicated list of tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens(Vec<Token>);

/// Wire/file format: `{"tokens": [1, 2, 3]}`
#[derive(Serialize, Deserialize)]
struct TokensFile {
    tokens: Vec<Token>,
}

impl Tokens {
    /// Build from an arbitrary list; sorts and deduplicates.
    pub fn new(mut tokens: Vec<Token>) -> Self {
        tokens.sort_unstable();
        tokens.dedup();
        Tokens(tokens)
    }

    pub fn as_slice(&self) -> &[Token] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.0.binary_search(&token).is_ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Token> {
        self.0.iter()
    }

    /// Serialize to the JSON file format.
    pub fn marshal(&self) -> Result<String> {
        Ok(serde_json::to_string(&TokensFile {
            tokens: self.0.clone(),
        })?)
    }

    /// Deserialize from the JSON file format.
    pub fn unmarshal(data: &str) -> Result<Self> {
        let file: TokensFile = serde_json::from_str(data)?;
        Ok(Tokens::new(file.tokens))
    }

    /// Load persisted tokens from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::unmarshal(&data)
    }

    /// Persist tokens to disk atomically (write-temp-then-rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.marshal()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl From<Vec<Token>> for Tokens {
    fn from(tokens: Vec<Token>) -> Self {
        Tokens::new(tokens)
    }
}

impl IntoIterator for Tokens {
    type Item = Token;
    type IntoIter = std::vec::IntoIter<Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Tokens {
    type Item = &'a Token;
    type IntoIter = std::slice::Iter<'a, Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Produces unique tokens for an instance joining the ring.
pub trait TokenGenerator: Send + Sync {
    /// Generate up to `requested` tokens, disjoint from `taken`.
    fn generate_tokens(&self, requested: usize, taken: &[Token]) -> Result<Tokens>;

    /// May this instance join the ring right now? Generators with ordering
    /// constraints (spread-minimizing) override this.
    fn can_join(&self, _ring: &RingDesc) -> Result<()> {
        Ok(())
    }

    /// Whether `can_join` must be consulted before joining.
    fn can_join_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_sorts_and_dedups() {
        let tokens = Tokens::new(vec![30, 10, 20, 10]);
        assert_eq!(tokens.as_slice(), &[10, 20, 30]);
    }

    #[test]
    fn test_marshal_round_trip() {
        let tokens = Tokens::new(vec![1, 5, 2_000_000_000, 42]);
        let data = tokens.marshal().unwrap();
        let back = Tokens::unmarshal(&data).unwrap();
        assert_eq!(back, tokens);
    }

    #[test]
    fn test_unmarshal_wire_format() {
        let tokens = Tokens::unmarshal(r#"{"tokens": [3, 1, 2]}"#).unwrap();
        assert_eq!(tokens.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_file_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");

        let tokens = Tokens::new((0..512).map(|i| i * 1000).collect());
        tokens.save(&path).unwrap();

        let loaded = Tokens::load(&path).unwrap();
        assert_eq!(loaded, tokens);

        // The temp file does not linger.
        assert!(!dir.path().join("tokens.tmp").exists());
    }

    #[test]
    fn test_contains() {
        let tokens = Tokens::new(vec![10, 20, 30]);
        assert!(tokens.contains(20));
        assert!(!tokens.contains(25));
    }
}
