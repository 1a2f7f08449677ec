//! Small helpers used while building hole-punch plans. Grounded in the
//! original's `pkg/nat/tools.go`.

use std::collections::HashSet;

use rand::Rng;

/// Draws `count` distinct integers from `[start, end)`. If `count` exceeds
/// the size of the range, every value in the range is returned instead.
pub fn no_repeat_rand_ints(start: i32, end: i32, count: usize) -> Vec<i32> {
    let (start, end) = if start > end { (end, start) } else { (start, end) };
    let span = (end - start) as usize;
    let count = count.min(span);

    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(count);
    let mut result = Vec::with_capacity(count);
    while result.len() < count {
        let x = rng.gen_range(start..end);
        if seen.insert(x) {
            result.push(x);
        }
    }
    result
}

/// Picks one element of `items` uniformly at random. Panics on an empty
/// slice, matching the original's unchecked `container[idx]`.
pub fn random_one<T: Clone>(items: &[T]) -> T {
    let idx = rand::thread_rng().gen_range(0..items.len());
    items[idx].clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_the_requested_count_of_distinct_values() {
        let got = no_repeat_rand_ints(0, 100, 10);
        assert_eq!(got.len(), 10);
        assert_eq!(got.iter().collect::<HashSet<_>>().len(), 10);
    }

    #[test]
    fn clamps_count_to_the_range_size() {
        let got = no_repeat_rand_ints(0, 5, 50);
        assert_eq!(got.len(), 5);
        let mut sorted = got.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn handles_a_reversed_range() {
        let got = no_repeat_rand_ints(100, 0, 3);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|v| (0..100).contains(v)));
    }

    #[test]
    fn random_one_returns_a_member_of_the_slice() {
        let items = vec!["a", "b", "c"];
        let picked = random_one(&items);
        assert!(items.contains(&picked));
    }
}
