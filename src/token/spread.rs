//! Spread-minimizing token generator
//!
//! Deterministic function of (zone, instance ordinal): adding instance `k`
//! to a ring already holding instances `0..k-1` reproduces exactly the
//! ownership distribution that would result from computing tokens for all
//! `k+1` instances from scratch. Internally runs a priority-queue
//! simulation where the widest token interval of the richest instance is
//! repeatedly split to carve out ownership for the newcomer.
//!
//! Invariants:
//! - every token of a zone is congruent to the zone's index mod 8, so
//!   per-zone token sets stay interleaved and collision-free across zones
//! - interval splits are a positive multiple of the zone count

use crate::common::{Error, Result, SpreadMinimizingConfig};
use crate::ring::model::RingDesc;
use crate::token::{Token, TokenGenerator, Tokens};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Whole circular space, `2^32`.
const TOTAL_TOKENS_COUNT: u64 = 1 << 32;

/// Tokens generated per instance.
pub const OPTIMAL_TOKENS_PER_INSTANCE: usize = 512;

/// Hard cap on zones; token congruence classes are taken mod this value.
pub const MAX_ZONES_COUNT: usize = 8;

pub struct SpreadMinimizingTokenGenerator {
    instance_ordinal: usize,
    zone_id: usize,
    can_join_enabled: bool,
    instance_prefix: String,
    zone: String,
}

/// Max-heap entry ordered by ownership (interval width).
struct OwnershipEntry<T> {
    ownership: f64,
    item: T,
}

impl<T> PartialEq for OwnershipEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ownership == other.ownership
    }
}
impl<T> Eq for OwnershipEntry<T> {}
impl<T> PartialOrd for OwnershipEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for OwnershipEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ownership.total_cmp(&other.ownership)
    }
}

/// A token together with its predecessor: the entry owns `(prev, token]`.
#[derive(Clone, Copy)]
struct RingToken {
    token: Token,
    prev: Token,
}

/// Clockwise distance from `from` to `to` on the circle.
fn token_distance(from: Token, to: Token) -> u64 {
    (to.wrapping_sub(from)) as u64 & (TOTAL_TOKENS_COUNT - 1)
}

/// Extract the numeric ordinal from an instance name like `ingester-5`.
fn parse_instance_ordinal(instance: &str) -> Result<usize> {
    let suffix = instance
        .rsplit('-')
        .next()
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        .ok_or_else(|| {
            Error::TokenGeneration(format!(
                "instance name {:?} does not end with a numeric ordinal",
                instance
            ))
        })?;
    suffix
        .parse()
        .map_err(|_| Error::TokenGeneration(format!("invalid instance ordinal in {:?}", instance)))
}

impl SpreadMinimizingTokenGenerator {
    pub fn new(cfg: &SpreadMinimizingConfig) -> Result<Self> {
        if cfg.zones.is_empty() {
            return Err(Error::TokenGeneration("no zones configured".into()));
        }
        if cfg.zones.len() > MAX_ZONES_COUNT {
            return Err(Error::TokenGeneration(format!(
                "number of zones {} exceeds the maximum {}",
                cfg.zones.len(),
                MAX_ZONES_COUNT
            )));
        }

        let mut zones = cfg.zones.clone();
        zones.sort_unstable();
        let zone_id = zones.iter().position(|z| *z == cfg.zone).ok_or_else(|| {
            Error::TokenGeneration(format!(
                "zone {:?} is not in the configured zone set",
                cfg.zone
            ))
        })?;

        let instance_ordinal = parse_instance_ordinal(&cfg.instance)?;
        let instance_prefix = cfg.instance[..cfg.instance.rfind('-').unwrap_or(0)].to_string();

        Ok(Self {
            instance_ordinal,
            zone_id,
            can_join_enabled: cfg.can_join_enabled,
            instance_prefix,
            zone: cfg.zone.clone(),
        })
    }

    pub fn instance_ordinal(&self) -> usize {
        self.instance_ordinal
    }

    pub fn zone_id(&self) -> usize {
        self.zone_id
    }

    /// Tokens of the ordinal-0 instance: evenly spaced points offset by the
    /// zone index, so all later splits inherit the congruence class.
    fn first_instance_tokens(&self) -> Vec<Token> {
        let token_distance =
            (TOTAL_TOKENS_COUNT / OPTIMAL_TOKENS_PER_INSTANCE as u64 / MAX_ZONES_COUNT as u64)
                * MAX_ZONES_COUNT as u64;
        (0..OPTIMAL_TOKENS_PER_INSTANCE as u64)
            .map(|i| (i * token_distance + self.zone_id as u64) as Token)
            .collect()
    }

    /// Target ownership of the next token, floored to a multiple of the
    /// zone-count modulus so the congruence class is preserved.
    fn optimal_token_ownership(
        optimal_instance_ownership: f64,
        curr_instance_ownership: f64,
        remaining_tokens: usize,
    ) -> u32 {
        let per_token =
            ((optimal_instance_ownership - curr_instance_ownership) as u64 / remaining_tokens as u64) as u32;
        (per_token / MAX_ZONES_COUNT as u32) * MAX_ZONES_COUNT as u32
    }

    /// Place a new token `optimal_token_ownership` past the interval start.
    fn calculate_new_token(token: RingToken, optimal_token_ownership: u32) -> Result<Token> {
        if (optimal_token_ownership as usize) < MAX_ZONES_COUNT {
            return Err(Error::TokenGeneration(format!(
                "token interval ({}, {}] cannot be split further",
                token.prev, token.token
            )));
        }
        // 2^32 is a multiple of the modulus, so a wrapping add of a
        // multiple-of-8 distance keeps the congruence class.
        Ok(token.prev.wrapping_add(optimal_token_ownership))
    }

    /// Simulate adding instances 0..=target one at a time; returns the token
    /// set of every simulated instance.
    fn tokens_by_instance_ordinal(&self) -> Result<HashMap<usize, Vec<Token>>> {
        let first_tokens = self.first_instance_tokens();
        let mut result = HashMap::new();

        if self.instance_ordinal == 0 {
            result.insert(0, first_tokens);
            return Ok(result);
        }

        // Per-instance max-heap of owned intervals.
        let mut token_queues: Vec<BinaryHeap<OwnershipEntry<RingToken>>> =
            Vec::with_capacity(self.instance_ordinal);
        let mut first_queue = BinaryHeap::with_capacity(OPTIMAL_TOKENS_PER_INSTANCE);
        for (i, &token) in first_tokens.iter().enumerate() {
            let prev = if i == 0 {
                *first_tokens.last().unwrap()
            } else {
                first_tokens[i - 1]
            };
            first_queue.push(OwnershipEntry {
                ownership: token_distance(prev, token) as f64,
                item: RingToken { token, prev },
            });
        }
        token_queues.push(first_queue);
        result.insert(0, first_tokens);

        // Max-heap of instances by current total ownership.
        let mut instance_queue: BinaryHeap<OwnershipEntry<usize>> = BinaryHeap::new();
        instance_queue.push(OwnershipEntry {
            ownership: TOTAL_TOKENS_COUNT as f64,
            item: 0,
        });

        for ordinal in 1..=self.instance_ordinal {
            let optimal_instance_ownership = TOTAL_TOKENS_COUNT as f64 / (ordinal + 1) as f64;
            let mut curr_ownership = 0.0;
            let mut tokens = Vec::with_capacity(OPTIMAL_TOKENS_PER_INSTANCE);
            let mut new_queue = BinaryHeap::with_capacity(OPTIMAL_TOKENS_PER_INSTANCE);
            let mut ignored: Vec<OwnershipEntry<usize>> = Vec::new();

            while curr_ownership < optimal_instance_ownership
                && tokens.len() < OPTIMAL_TOKENS_PER_INSTANCE
            {
                let optimal_token_ownership = Self::optimal_token_ownership(
                    optimal_instance_ownership,
                    curr_ownership,
                    OPTIMAL_TOKENS_PER_INSTANCE - tokens.len(),
                );

                let richest_ownership = match instance_queue.peek() {
                    Some(entry) => entry.ownership,
                    None => {
                        return Err(Error::TokenGeneration(format!(
                            "it was impossible to add {} tokens to instance ordinal {}: no instance left to take ownership from",
                            OPTIMAL_TOKENS_PER_INSTANCE - tokens.len(),
                            ordinal
                        )))
                    }
                };
                if richest_ownership <= optimal_token_ownership as f64 {
                    return Err(Error::TokenGeneration(format!(
                        "it was impossible to add {} tokens to instance ordinal {}: the richest instance owns only {:.0}",
                        OPTIMAL_TOKENS_PER_INSTANCE - tokens.len(),
                        ordinal,
                        richest_ownership
                    )));
                }

                let richest_instance = instance_queue.peek().map(|e| e.item).unwrap();
                let widest_ownership = token_queues[richest_instance]
                    .peek()
                    .map(|e| e.ownership)
                    .unwrap_or(0.0);
                if widest_ownership <= optimal_token_ownership as f64 {
                    // None of this instance's intervals is wide enough;
                    // set it aside for the rest of this ordinal's round.
                    ignored.push(instance_queue.pop().unwrap());
                    continue;
                }

                let widest = token_queues[richest_instance].peek().unwrap().item;
                let new_token = Self::calculate_new_token(widest, optimal_token_ownership)?;
                let new_ownership = token_distance(widest.prev, new_token) as f64;

                tokens.push(new_token);
                curr_ownership += new_ownership;
                new_queue.push(OwnershipEntry {
                    ownership: new_ownership,
                    item: RingToken {
                        token: new_token,
                        prev: widest.prev,
                    },
                });

                // The split interval's old token now starts at the new token.
                {
                    let mut top = token_queues[richest_instance].peek_mut().unwrap();
                    top.item.prev = new_token;
                    top.ownership -= new_ownership;
                }
                {
                    let mut top = instance_queue.peek_mut().unwrap();
                    top.ownership -= new_ownership;
                }
            }

            instance_queue.extend(ignored);

            tokens.sort_unstable();
            result.insert(ordinal, tokens.clone());

            if ordinal < self.instance_ordinal {
                instance_queue.push(OwnershipEntry {
                    ownership: curr_ownership,
                    item: ordinal,
                });
                token_queues.push(new_queue);
            }
        }

        Ok(result)
    }

    /// All tokens of this generator's instance.
    pub fn generate_all_tokens(&self) -> Result<Vec<Token>> {
        let mut by_ordinal = self.tokens_by_instance_ordinal()?;
        by_ordinal
            .remove(&self.instance_ordinal)
            .ok_or_else(|| Error::TokenGeneration("instance ordinal missing from simulation".into()))
    }
}

impl TokenGenerator for SpreadMinimizingTokenGenerator {
    fn generate_tokens(&self, requested: usize, taken: &[Token]) -> Result<Tokens> {
        let taken: HashSet<Token> = taken.iter().copied().collect();
        let all = self.generate_all_tokens()?;
        let tokens: Vec<Token> = all
            .into_iter()
            .filter(|t| !taken.contains(t))
            .take(requested)
            .collect();
        Ok(Tokens::new(tokens))
    }

    /// The ordinal predecessor in the same zone must already hold tokens,
    /// otherwise a later joiner would steal intervals the simulation
    /// reserves for the predecessor.
    fn can_join(&self, ring: &RingDesc) -> Result<()> {
        if !self.can_join_enabled || self.instance_ordinal == 0 {
            return Ok(());
        }

        let predecessor = format!("{}-{}", self.instance_prefix, self.instance_ordinal - 1);
        match ring.instances.get(&predecessor) {
            Some(instance) if instance.zone == self.zone && !instance.tokens.is_empty() => Ok(()),
            _ => Err(Error::TokenGeneration(format!(
                "instance {:?} cannot join: predecessor {:?} holds no tokens yet",
                format!("{}-{}", self.instance_prefix, self.instance_ordinal),
                predecessor
            ))),
        }
    }

    fn can_join_enabled(&self) -> bool {
        self.can_join_enabled
    }
}
