//! Mutually exclusive selection among weighted triggers.
//!
//! Weights are integer percentages. Declared order assigns each weighted trigger a
//! half-open range of buckets in `0..100`; the bucket for a firing is derived from the
//! ids of the events that satisfied it, so the same event set always selects the same
//! trigger.

use sha2::{Digest, Sha256};

pub const BUCKETS: u32 = 100;

/// Hash bucket in `0..100` for a set of event ids, independent of order.
pub fn bucket_for<'a, I>(event_ids: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let mut ids: Vec<&str> = event_ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % BUCKETS as u64) as u32
}

/// Index into `weights` of the trigger whose range contains `bucket`.
/// Zero weights never own a range. `None` when the bucket falls past the total weight.
pub fn select_weighted(weights: &[u32], bucket: u32) -> Option<usize> {
    let mut start = 0u32;
    for (index, weight) in weights.iter().enumerate() {
        if *weight == 0 {
            continue;
        }
        let end = start + weight;
        if bucket >= start && bucket < end {
            return Some(index);
        }
        start = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thirty_seventy_partition() {
        let weights = [30, 70];
        let mut counts = [0; 2];
        for bucket in 0..BUCKETS {
            let selected = select_weighted(&weights, bucket).expect("every bucket selects");
            counts[selected] += 1;
        }
        assert_eq!(counts, [30, 70]);
    }

    #[test]
    fn test_zero_weight_is_skipped() {
        let weights = [0, 50, 0, 50];
        assert_eq!(select_weighted(&weights, 0), Some(1));
        assert_eq!(select_weighted(&weights, 49), Some(1));
        assert_eq!(select_weighted(&weights, 50), Some(3));
        assert_eq!(select_weighted(&weights, 99), Some(3));
    }

    #[test]
    fn test_under_allocated_weights_leave_gap() {
        assert_eq!(select_weighted(&[20, 20], 39), Some(1));
        assert_eq!(select_weighted(&[20, 20], 40), None);
    }

    #[test]
    fn test_bucket_is_deterministic() {
        let a = bucket_for(["evt-2", "evt-1"]);
        assert_eq!(a, bucket_for(["evt-1", "evt-2"]));
        assert!(a < BUCKETS);
    }
}
