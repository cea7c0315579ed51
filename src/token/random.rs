//! Random token generator

use crate::common::{Error, Result};
use crate::token::{Token, TokenGenerator, Tokens};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Mutex;

/// Draws uniform random 32-bit tokens, rejecting collisions with already
/// taken tokens. Thread-safe via an internal lock.
pub struct RandomTokenGenerator {
    rng: Mutex<StdRng>,
}

impl RandomTokenGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic generator for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomTokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator for RandomTokenGenerator {
    fn generate_tokens(&self, requested: usize, taken: &[Token]) -> Result<Tokens> {
        let mut used: HashSet<Token> = taken.iter().copied().collect();
        let mut out = Vec::with_capacity(requested);

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::TokenGeneration("rng lock poisoned".into()))?;

        while out.len() < requested {
            let candidate: Token = rng.gen();
            if used.insert(candidate) {
                out.push(candidate);
            }
        }

        Ok(Tokens::new(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_requested_count() {
        let gen = RandomTokenGenerator::with_seed(1);
        let tokens = gen.generate_tokens(128, &[]).unwrap();
        assert_eq!(tokens.len(), 128);
    }

    #[test]
    fn test_disjoint_from_taken() {
        let gen = RandomTokenGenerator::with_seed(2);
        let taken = gen.generate_tokens(256, &[]).unwrap();
        let fresh = gen
            .generate_tokens(256, taken.as_slice())
            .unwrap();

        for token in &fresh {
            assert!(!taken.contains(*token));
        }
    }

    #[test]
    fn test_sorted_unique() {
        let gen = RandomTokenGenerator::with_seed(3);
        let tokens = gen.generate_tokens(512, &[]).unwrap();
        let slice = tokens.as_slice();
        for pair in slice.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
