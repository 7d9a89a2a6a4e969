//! Deterministic train/val/test assignment.

use sha2::{Digest, Sha256};

use crate::config::types::SplitConfig;

pub const TRAIN: &str = "train";
pub const VAL: &str = "val";
pub const TEST: &str = "test";

/// Position of `episode_id` in [0, 1], stable for a given seed.
#[must_use]
pub fn split_fraction(seed: u64, episode_id: &str) -> f64 {
    let digest = Sha256::digest(format!("{seed}:{episode_id}").as_bytes());
    let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    f64::from(bucket) / f64::from(u32::MAX)
}

/// Split name for `episode_id`.
#[must_use]
pub fn assign_split(seed: u64, episode_id: &str, splits: &SplitConfig) -> &'static str {
    let fraction = split_fraction(seed, episode_id);
    if fraction < splits.train {
        TRAIN
    } else if fraction < splits.train + splits.val {
        VAL
    } else {
        TEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_is_deterministic() {
        let splits = SplitConfig::default();
        for i in 0..50 {
            let id = format!("ep-{i}");
            assert_eq!(assign_split(7, &id, &splits), assign_split(7, &id, &splits));
        }
    }

    #[test]
    fn test_fractions_respected_roughly() {
        let splits = SplitConfig::default();
        let train = (0..2000)
            .filter(|i| assign_split(42, &format!("ep-{i}"), &splits) == TRAIN)
            .count();
        assert!((1450..1750).contains(&train), "train = {train}");
    }

    #[test]
    fn test_all_train() {
        let splits = SplitConfig { train: 1.0, val: 0.0 };
        assert!((0..100).all(|i| assign_split(1, &format!("e{i}"), &splits) == TRAIN));
    }

    #[test]
    fn test_first_hex_digits_match_fraction() {
        let digest = Sha256::digest(b"42:ep-0");
        let hex = format!("{digest:x}");
        let expected = f64::from(u32::from_str_radix(&hex[..8], 16).unwrap()) / f64::from(u32::MAX);
        assert!((split_fraction(42, "ep-0") - expected).abs() < f64::EPSILON);
    }
}
