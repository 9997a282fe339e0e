//! Startup timer analysis: common-divisor discovery over timing deltas.
//!
//! Many counters do not increment in steps of one. A counter ticking in
//! multiples of, say, 24 would inflate every delta by that factor and make
//! the low bits look like entropy when they are constant. The power-up test
//! records a window of deltas; this module derives the common divisor that is
//! factored out of every subsequent delta, and rejects timers that are too
//! coarse or carry almost no variation at all.

use crate::error::Error;

/// A candidate divisor of 100 or larger means the timer is too coarse to
/// carry jitter in its low bits.
const COARSE_DIVISOR_CUTOFF: u64 = 100;

/// Euclidean GCD.
fn gcd64(mut a: u64, mut b: u64) -> u64 {
    if a < b {
        std::mem::swap(&mut a, &mut b);
    }
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Fixed-size recorder for the power-up delta series.
pub struct DeltaHistory {
    deltas: Vec<u64>,
}

impl DeltaHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            deltas: vec![0u64; capacity],
        }
    }

    /// Record the delta observed at measurement `idx`.
    pub fn record(&mut self, idx: usize, delta: u64) {
        if let Some(slot) = self.deltas.get_mut(idx) {
            *slot = delta;
        }
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.deltas
    }

    /// Derive the common divisor of the recorded series.
    ///
    /// The running GCD is reduced across all deltas. Rejects with
    /// [`Error::MinVarVar`] when the summed absolute successive differences
    /// do not exceed `n - 1` (a timer with essentially no jitter), and with
    /// [`Error::CoarseTime`] when the divisor reaches 100.
    pub fn analyze(&self) -> Result<u64, Error> {
        let n = self.deltas.len();
        if n == 0 {
            return Err(Error::ProgErr);
        }

        let mut running_gcd = 0u64;
        let mut delta_sum = 0u64;

        for (i, &delta) in self.deltas.iter().enumerate() {
            if i > 0 {
                let prev = self.deltas[i - 1];
                delta_sum = delta_sum.saturating_add(prev.abs_diff(delta));
            }
            running_gcd = gcd64(delta, running_gcd);
        }

        // Variations of the deltas must on average exceed one, otherwise the
        // per-sample entropy claim of 1/osr bits cannot hold.
        if delta_sum <= (n as u64) - 1 {
            return Err(Error::MinVarVar);
        }

        if running_gcd >= COARSE_DIVISOR_CUTOFF {
            return Err(Error::CoarseTime);
        }

        Ok(running_gcd.max(1))
    }
}

/// Self-test of the analyzer on a synthetic series with a known divisor.
pub fn self_test() -> Result<(), Error> {
    const ELEMENTS: usize = 10;
    const EXPECTED: u64 = 3;

    let mut history = DeltaHistory::new(ELEMENTS);
    for i in 0..ELEMENTS {
        history.record(i, ((i as u64) + 1) * EXPECTED);
    }

    match history.analyze() {
        Ok(divisor) if divisor == EXPECTED => Ok(()),
        _ => Err(Error::Gcd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcd64_basics() {
        assert_eq!(gcd64(12, 18), 6);
        assert_eq!(gcd64(18, 12), 6);
        assert_eq!(gcd64(17, 0), 17);
        assert_eq!(gcd64(0, 17), 17);
        assert_eq!(gcd64(7, 13), 1);
    }

    #[test]
    fn test_self_test_passes() {
        assert!(self_test().is_ok());
    }

    #[test]
    fn test_common_divisor_is_found() {
        // Deltas drawn only from {17, 34}: the divisor must come out as 17.
        let mut history = DeltaHistory::new(64);
        for i in 0..64 {
            history.record(i, if i % 2 == 0 { 17 } else { 34 });
        }
        assert_eq!(history.analyze().unwrap(), 17);
    }

    #[test]
    fn test_coprime_series_yields_one() {
        let mut history = DeltaHistory::new(16);
        let values = [3u64, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61];
        for (i, &v) in values.iter().enumerate() {
            history.record(i, v);
        }
        assert_eq!(history.analyze().unwrap(), 1);
    }

    #[test]
    fn test_coarse_timer_rejected() {
        // Every delta a multiple of 100: the timer granularity swallows all
        // jitter and the series must be rejected.
        let mut history = DeltaHistory::new(32);
        for i in 0..32 {
            history.record(i, ((i as u64) + 1) * 100);
        }
        assert_eq!(history.analyze(), Err(Error::CoarseTime));
    }

    #[test]
    fn test_constant_series_rejected_as_min_variation() {
        let mut history = DeltaHistory::new(32);
        for i in 0..32 {
            history.record(i, 42);
        }
        assert_eq!(history.analyze(), Err(Error::MinVarVar));
    }

    #[test]
    fn test_alternating_by_one_rejected() {
        // Successive differences of exactly one sum to n-1: still too little.
        let mut history = DeltaHistory::new(8);
        for i in 0..8 {
            history.record(i, 10 + ((i as u64) % 2));
        }
        assert_eq!(history.analyze(), Err(Error::MinVarVar));
    }

    #[test]
    fn test_factor_out_preserves_product() {
        // (post-GCD delta) * gcd reconstructs the raw delta exactly.
        let mut history = DeltaHistory::new(16);
        let raw: Vec<u64> = (1..=16u64).map(|i| i * 8).collect();
        for (i, &v) in raw.iter().enumerate() {
            history.record(i, v);
        }
        let divisor = history.analyze().unwrap();
        assert_eq!(divisor, 8);
        for &v in &raw {
            assert_eq!((v / divisor) * divisor, v);
        }
    }
}
