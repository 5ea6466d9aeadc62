//! Rotation order over the combination registry
//!
//! The cursor is a single linear index `credential + model * K`, advanced
//! modulo `K * M`. Deriving both indices from it keeps wraparound in one
//! place: all credentials are tried under a model before the next model.

use std::time::Instant;

use tracing::debug;

use crate::registry::Registry;
use crate::tracker::ExhaustionTracker;

/// Outcome of stepping the cursor by one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub cursor: usize,
    /// The step wrapped around to the first combination.
    pub lapped: bool,
}

/// Advance the cursor by one combination in credential-major order.
pub fn advance(registry: &Registry, cursor: usize) -> Step {
    let next = (cursor + 1) % registry.total();
    Step {
        cursor: next,
        lapped: next == 0,
    }
}

/// Find the first non-exhausted combination at or after `cursor`.
///
/// Tests at most `K * M` candidates. Returns the cursor of the first usable
/// one, or `None` when every combination is exhausted.
pub fn scan(
    registry: &Registry,
    tracker: &ExhaustionTracker,
    cursor: usize,
    now: Instant,
) -> Option<usize> {
    let total = registry.total();
    (0..total)
        .map(|offset| (cursor + offset) % total)
        .find(|&candidate| {
            let combination = registry.combination_at(candidate);
            let exhausted = tracker.is_exhausted(combination, now);
            if exhausted {
                debug!(%combination, "skipping exhausted combination");
            }
            !exhausted
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Combination, Credential};

    fn registry(k: usize, m: usize) -> Registry {
        let credentials = (0..k)
            .map(|i| Credential::new(format!("key-{}", i + 1), format!("k{i}")))
            .collect();
        let models = (0..m).map(|i| format!("model-{i}")).collect();
        Registry::new(credentials, models).unwrap()
    }

    #[test]
    fn advance_visits_every_combination_once_per_lap() {
        let r = registry(2, 2);
        let mut cursor = 0;
        let mut visited = vec![r.combination_at(cursor)];
        let mut laps = 0;
        for _ in 0..r.total() {
            let step = advance(&r, cursor);
            cursor = step.cursor;
            if step.lapped {
                laps += 1;
            }
            visited.push(r.combination_at(cursor));
        }
        assert_eq!(
            visited,
            vec![
                Combination::new(0, 0),
                Combination::new(1, 0),
                Combination::new(0, 1),
                Combination::new(1, 1),
                Combination::new(0, 0),
            ]
        );
        assert_eq!(laps, 1);
    }

    #[test]
    fn advance_single_combination_always_laps() {
        let r = registry(1, 1);
        let step = advance(&r, 0);
        assert_eq!(step, Step { cursor: 0, lapped: true });
    }

    #[test]
    fn scan_fresh_returns_cursor() {
        let r = registry(4, 4);
        let tracker = ExhaustionTracker::new();
        assert_eq!(scan(&r, &tracker, 0, Instant::now()), Some(0));
        assert_eq!(scan(&r, &tracker, 5, Instant::now()), Some(5));
    }

    #[test]
    fn scan_skips_exhausted_in_credential_major_order() {
        let r = registry(3, 2);
        let mut tracker = ExhaustionTracker::new();
        let now = Instant::now();
        tracker.mark_exhausted(Combination::new(0, 0), now);
        tracker.mark_exhausted(Combination::new(1, 0), now);

        assert_eq!(scan(&r, &tracker, 0, now), Some(2));

        tracker.mark_exhausted(Combination::new(2, 0), now);
        let found = scan(&r, &tracker, 0, now).unwrap();
        assert_eq!(r.combination_at(found), Combination::new(0, 1));
    }

    #[test]
    fn scan_wraps_past_the_end() {
        let r = registry(2, 2);
        let mut tracker = ExhaustionTracker::new();
        let now = Instant::now();
        tracker.mark_exhausted(Combination::new(1, 1), now);
        assert_eq!(scan(&r, &tracker, 3, now), Some(0));
    }

    #[test]
    fn scan_all_exhausted_is_none() {
        let r = registry(2, 2);
        let mut tracker = ExhaustionTracker::new();
        let now = Instant::now();
        for combination in r.combinations() {
            tracker.mark_exhausted(combination, now);
        }
        assert_eq!(scan(&r, &tracker, 1, now), None);
    }
}
