//! Percentage rollout bucketing.
use std::io::Cursor;

use crate::models::Distribution;

/// Number of buckets in a rollout. Buckets are numbered `1..=ONE_HUNDRED`.
pub(crate) const ONE_HUNDRED: u32 = 100;

/// Computes the rollout bucket of a target.
///
/// The bucket must be identical across SDK implementations in every language, so the hash is
/// MurmurHash3 (x86, 32-bit, seed 0) over the UTF-8 bytes of `"{bucket_by}:{value}"`.
pub(crate) fn bucket(bucket_by: &str, value: &str) -> u32 {
    let input = format!("{bucket_by}:{value}");
    let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), 0)
        .expect("reading from an in-memory buffer should never fail");
    hash % ONE_HUNDRED + 1
}

impl Distribution {
    /// Select the variation for `bucket`: the first variation whose cumulative weight reaches the
    /// bucket. The last variation catches any remainder when weights sum to less than 100.
    pub(crate) fn select(&self, bucket: u32) -> Option<&str> {
        let mut cumulative: i64 = 0;
        for weighted in &self.variations {
            cumulative += weighted.weight;
            if i64::from(bucket) <= cumulative {
                return Some(&weighted.variation);
            }
        }
        self.variations.last().map(|v| v.variation.as_str())
    }
}
