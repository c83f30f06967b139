//! Gap detection and bounded backfill planning.
//!
//! The distribution service hands out NSUs in strictly increasing order, but a batch may skip
//! numbers (documents that became visible later, or were lost upstream). The `GapTracker` finds the
//! missing NSUs of each batch and plans targeted pulls for them, never issuing more than a fixed
//! number of pulls per sync cycle.

use crate::ws::Nsu;
use tracing::{info, warn};

/// Missing NSU ranges of a batch, as inclusive `(first, last)` pairs.
///
/// Only the NSUs of `batch` are scanned, starting from `previous` (the cursor that preceded the
/// batch). Unsorted and duplicate NSUs are tolerated.
pub fn find_gaps(previous: Nsu, batch: &[Nsu]) -> Vec<(u64, u64)> {
    let mut sorted: Vec<u64> = batch.iter().map(Nsu::value).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut gaps = Vec::new();
    let mut prev = previous.value();
    for nsu in sorted {
        if nsu > prev.saturating_add(1) {
            gaps.push((prev + 1, nsu - 1));
        }
        prev = prev.max(nsu);
    }
    gaps
}

/// Per-cycle backfill budget
#[derive(Debug, Clone)]
pub struct GapTracker {
    /// Maximum targeted pulls per cycle
    cap: usize,
    /// Targeted pulls planned so far in this cycle
    issued: usize,
    /// Gaps detected over the whole cycle, including the ones left for later
    detected: usize,
    /// Missing NSUs actually recovered by a targeted pull
    recovered: usize,
    /// Set when a backfill pull failed; no more pulls this cycle
    halted: bool,
}

impl GapTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            issued: 0,
            detected: 0,
            recovered: 0,
            halted: false,
        }
    }

    /// Plan the targeted pulls for one batch, reserving them from the remaining budget.
    ///
    /// Planned pulls count against the cap whether or not they recover anything.
    ///
    /// # Arguments
    /// * `previous` - Cursor value that preceded the batch.
    /// * `batch` - NSUs received in the batch.
    ///
    /// # Returns
    /// The NSUs to pull, lowest first, never more than what is left of the cycle cap.
    pub fn plan(&mut self, previous: Nsu, batch: &[Nsu]) -> Vec<Nsu> {
        let gaps = find_gaps(previous, batch);
        let missing: u64 = gaps.iter().map(|(start, end)| end - start + 1).sum();
        self.detected += usize::try_from(missing).unwrap_or(usize::MAX);

        if gaps.is_empty() {
            return Vec::new();
        }
        if self.halted {
            warn!("Skipping {} missing NSUs, backfill halted for this cycle", missing);
            return Vec::new();
        }

        let mut planned = Vec::new();
        'outer: for (start, end) in gaps {
            for nsu in start..=end {
                if self.issued >= self.cap {
                    break 'outer;
                }
                planned.push(Nsu::new(nsu));
                self.issued += 1;
            }
        }

        if (planned.len() as u64) < missing {
            info!(
                "Backfill cap reached: {} of {} missing NSUs scheduled",
                planned.len(),
                missing
            );
        }
        planned
    }

    /// Stop planning pulls for the rest of the cycle.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Record a planned pull that returned its document.
    pub fn complete(&mut self) {
        self.recovered += 1;
    }

    pub fn issued(&self) -> usize {
        self.issued
    }

    /// Missing NSUs detected this cycle and not recovered
    pub fn remaining(&self) -> usize {
        self.detected.saturating_sub(self.recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nsus(values: &[u64]) -> Vec<Nsu> {
        values.iter().copied().map(Nsu::new).collect()
    }

    #[test]
    fn gaps_are_relative_to_the_previous_cursor() {
        assert_eq!(find_gaps(Nsu::new(100), &nsus(&[101, 103, 104])), vec![(102, 102)]);
        assert_eq!(find_gaps(Nsu::new(100), &nsus(&[104, 101])), vec![(102, 103)]);
        assert_eq!(find_gaps(Nsu::new(100), &nsus(&[103])), vec![(101, 102)]);
        assert!(find_gaps(Nsu::new(100), &nsus(&[101, 102, 102])).is_empty());
        assert!(find_gaps(Nsu::new(100), &[]).is_empty());
    }

    #[test]
    fn planning_never_exceeds_the_cycle_cap() {
        let mut tracker = GapTracker::new(3);

        let first = tracker.plan(Nsu::new(0), &nsus(&[2, 4]));
        assert_eq!(first, nsus(&[1, 3]));

        let second = tracker.plan(Nsu::new(4), &nsus(&[10]));
        assert_eq!(second, nsus(&[5]));

        assert!(tracker.plan(Nsu::new(10), &nsus(&[20])).is_empty());
        assert_eq!(tracker.issued(), 3);
        assert_eq!(tracker.remaining(), 2 + 5 + 9);

        for _ in first.iter().chain(&second) {
            tracker.complete();
        }
        assert_eq!(tracker.remaining(), 4 + 9);
    }

    #[test]
    fn unrecovered_pulls_stay_remaining() {
        let mut tracker = GapTracker::new(2);
        let planned = tracker.plan(Nsu::new(0), &nsus(&[1, 10]));
        assert_eq!(planned, nsus(&[2, 3]));

        // the first pull came back empty, the second was never sent
        tracker.halt();
        assert_eq!(tracker.issued(), 2);
        assert_eq!(tracker.remaining(), 8);
    }

    #[test]
    fn halted_tracker_plans_nothing() {
        let mut tracker = GapTracker::new(10);
        tracker.halt();
        assert!(tracker.plan(Nsu::new(0), &nsus(&[5])).is_empty());
        assert_eq!(tracker.remaining(), 4);
    }
}
