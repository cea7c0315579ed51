//! Utility functions for shardring

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hash an arbitrary key onto the 32-bit ring space
pub fn hash_key(key: &str) -> u32 {
    let hash = blake3::hash(key.as_bytes());
    u32::from_le_bytes(hash.as_bytes()[0..4].try_into().unwrap())
}

/// Derive a deterministic PRNG seed from a shard identifier and zone.
///
/// The same (identifier, zone) pair always yields the same seed, which is
/// what makes shuffle shards stable across processes.
pub fn shuffle_shard_seed(identifier: &str, zone: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(identifier.as_bytes());
    hasher.update(b"\0");
    hasher.update(zone.as_bytes());
    let hash = hasher.finalize();
    u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap())
}

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if s.ends_with("ms") {
        (&s[..s.len() - 2], "ms")
    } else {
        (&s[..s.len() - 1], &s[s.len() - 1..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_key_deterministic() {
        assert_eq!(hash_key("tenant-1"), hash_key("tenant-1"));
        assert_ne!(hash_key("tenant-1"), hash_key("tenant-2"));
    }

    #[test]
    fn test_shuffle_shard_seed() {
        assert_eq!(
            shuffle_shard_seed("tenant-1", "zone-a"),
            shuffle_shard_seed("tenant-1", "zone-a")
        );
        assert_ne!(
            shuffle_shard_seed("tenant-1", "zone-a"),
            shuffle_shard_seed("tenant-1", "zone-b")
        );
        assert_ne!(
            shuffle_shard_seed("tenant-1", "zone-a"),
            shuffle_shard_seed("tenant-2", "zone-a")
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604800));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }
}
