//! Collision-free node name allocation

use std::collections::HashSet;

/// Allocate `count` new node names derived from `base`
///
/// - A single name keeps `base` as-is when it is free, otherwise it becomes
///   `base-(max+1)`.
/// - A batch always gets consecutive suffixes `base-(max+1)..=base-(max+count)`,
///   even when `base` itself is free.
///
/// `max` is the largest `n` for which `base-n` is already taken (0 if none).
/// Names that merely start with `base` but are not `base-<digits>` do not count.
/// A non-positive `count` yields nothing.
pub fn allocate_hostnames(existing: &HashSet<String>, base: &str, count: i64) -> Vec<String> {
    if count <= 0 {
        return Vec::new();
    }

    if count == 1 && !existing.contains(base) {
        return vec![base.to_string()];
    }

    let mut next = max_suffix(existing, base) + 1;
    let mut names = Vec::new();
    while (names.len() as i64) < count {
        let candidate = format!("{}-{}", base, next);
        next += 1;
        // Only reachable with non-canonical suffixes such as `base-007`
        // or ones past u64::MAX.
        if existing.contains(&candidate) {
            continue;
        }
        names.push(candidate);
    }
    names
}

fn max_suffix(existing: &HashSet<String>, base: &str) -> u128 {
    existing
        .iter()
        .filter_map(|name| name.strip_prefix(base)?.strip_prefix('-'))
        .filter(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|suffix| suffix.parse::<u64>().ok())
        .map(u128::from)
        .max()
        .unwrap_or(0)
}
