use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const USER_MIX: u64 = 0x9E37_79B9_7F4A_7C15;
const OFFSET_MIX: u64 = 0xC2B2_AE3D_27D4_EB4F;
const LEN_MIX: u64 = 0x1656_67B1_9E37_79F9;

/// Folds the selection inputs into the generator seed. The mix is order
/// sensitive and must stay stable: skip accounting recomputes past batches
/// from `(user_id, offset)` alone.
pub fn seed(user_id: i64, offset: u64, len: usize) -> u64 {
    let mut h = (user_id as u64).wrapping_mul(USER_MIX);
    h ^= offset.wrapping_add(1).wrapping_mul(OFFSET_MIX);
    h = h.rotate_left(31) ^ (len as u64).wrapping_mul(LEN_MIX);
    h ^= h >> 29;
    h
}

/// Picks the targets shown to `user_id` at rotation `offset`.
///
/// Returns `min(k, targets.len())` items (`k` is treated as at least 1) in a
/// pseudo-random order that depends only on the arguments.
pub fn select<T: Clone>(targets: &[T], user_id: i64, offset: u64, k: usize) -> Vec<T> {
    if targets.is_empty() {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed(user_id, offset, targets.len()));
    let mut shuffled = targets.to_vec();
    shuffled.shuffle(&mut rng);
    shuffled.truncate(k.max(1).min(targets.len()));
    shuffled
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("@chan{i}")).collect()
    }

    #[test]
    fn empty_targets_select_nothing() {
        let targets: Vec<String> = Vec::new();
        assert!(select(&targets, 7, 0, 4).is_empty());
    }

    #[test]
    fn zero_k_still_shows_one() {
        let targets = names(5);
        assert_eq!(select(&targets, 7, 0, 0).len(), 1);
    }

    #[test]
    fn k_larger_than_list_returns_permutation() {
        let targets = names(3);
        let picked = select(&targets, 99, 2, 10);
        assert_eq!(picked.len(), 3);
        let set: HashSet<_> = picked.iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn seed_is_order_sensitive() {
        assert_ne!(seed(1, 2, 3), seed(2, 1, 3));
        assert_ne!(seed(1, 0, 3), seed(1, 0, 4));
    }

    #[test]
    fn offsets_rotate_the_batch() {
        let targets = names(10);
        let batches: HashSet<Vec<String>> = (0..16)
            .map(|offset| select(&targets, 4242, offset, 3))
            .collect();
        assert!(batches.len() > 1);
    }

    proptest! {
        #[test]
        fn selection_is_deterministic(
            user_id in any::<i64>(),
            offset in any::<u64>(),
            k in 0usize..16,
            n in 0usize..24,
        ) {
            let targets = names(n);
            let first = select(&targets, user_id, offset, k);
            let second = select(&targets, user_id, offset, k);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.len(), if n == 0 { 0 } else { k.max(1).min(n) });
        }

        #[test]
        fn selection_draws_from_targets_without_repeats(
            user_id in any::<i64>(),
            offset in any::<u64>(),
            k in 1usize..8,
            n in 1usize..16,
        ) {
            let targets = names(n);
            let picked = select(&targets, user_id, offset, k);
            let unique: HashSet<_> = picked.iter().collect();
            prop_assert_eq!(unique.len(), picked.len());
            prop_assert!(picked.iter().all(|t| targets.contains(t)));
        }

        #[test]
        fn sampled_offsets_do_not_all_agree(user_id in any::<i64>(), base in 0u64..1_000_000) {
            let targets = names(8);
            let batches: HashSet<Vec<String>> = (base..base + 12)
                .map(|offset| select(&targets, user_id, offset, 2))
                .collect();
            prop_assert!(batches.len() > 1);
        }
    }
}
