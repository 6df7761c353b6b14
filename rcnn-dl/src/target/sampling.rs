use crate::common::*;

/// Pick at most `max_count` of `candidates` without replacement.
///
/// The candidates are returned as is if they do not exceed `max_count`.
/// The selected values keep their relative order.
pub fn subsample<R>(candidates: &[i64], max_count: usize, rng: &mut R) -> Vec<i64>
where
    R: Rng + ?Sized,
{
    if candidates.len() <= max_count {
        return candidates.to_vec();
    }

    let mut positions = rand::seq::index::sample(rng, candidates.len(), max_count).into_vec();
    positions.sort_unstable();
    positions.into_iter().map(|pos| candidates[pos]).collect()
}

/// Draw `count` values from `candidates` uniformly with replacement.
pub fn sample_with_replacement<R>(candidates: &[i64], count: usize, rng: &mut R) -> Vec<i64>
where
    R: Rng + ?Sized,
{
    if candidates.is_empty() {
        return vec![];
    }
    (0..count)
        .map(|_| candidates[rng.gen_range(0..candidates.len())])
        .collect()
}

/// Draw exactly `count` values, with replacement only if the candidates are
/// fewer than `count`.
pub fn sample_to_count<R>(candidates: &[i64], count: usize, rng: &mut R) -> Vec<i64>
where
    R: Rng + ?Sized,
{
    if candidates.len() < count {
        sample_with_replacement(candidates, count, rng)
    } else {
        subsample(candidates, count, rng)
    }
}
