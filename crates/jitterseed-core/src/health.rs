//! SP800-90B health tests: stuck test, RCT, APT, lag predictor and the
//! distribution proportion test.
//!
//! Every post-GCD time delta runs through [`HealthState::insert`], which
//! feeds all tests and reports whether the sample is stuck. Failures
//! accumulate in a bitset with separate intermittent and permanent bits;
//! permanent bits never clear for the lifetime of the collector. Test
//! results are only reported to callers when FIPS mode is enabled.

use bitflags::bitflags;

use crate::error::Error;

/// APT window size per SP800-90B section 4.4.2.
pub const APT_WINDOW_SIZE: u32 = 512;

/// Bitmask selecting the delta bits fed to the APT. The full 64 bits are
/// used: the GCD is already divided out, so no dead low-order bits remain,
/// and truncation has been shown to weaken the test.
const APT_MASK: u64 = u64::MAX;

/// Lag predictor window; the predictor is reset between windows.
pub const LAG_WINDOW_SIZE: u32 = 1 << 17;
/// Delta history depth of the lag predictor. Power of two, at least 4.
pub const LAG_HISTORY_SIZE: usize = 8;
const LAG_MASK: usize = LAG_HISTORY_SIZE - 1;

/// APT cutoff per OSR (index = osr - 1) for a significance level of 2^-30
/// and an entropy claim of 1/osr bits per sample.
const APT_CUTOFF_LOOKUP: [u32; 15] = [
    325, 422, 459, 477, 488, 494, 499, 502, 505, 507, 508, 510, 511, 512, 512,
];

/// APT permanent-failure cutoff per OSR for a significance level of 2^-60.
const APT_CUTOFF_PERMANENT_LOOKUP: [u32; 15] = [
    355, 447, 479, 494, 502, 507, 510, 512, 512, 512, 512, 512, 512, 512, 512,
];

/// Lag predictor global cutoff per OSR (index = osr - 1): the permitted
/// total number of correct predictions inside one window, derived from the
/// inverse binomial CDF with p = 2^(-1/osr).
const LAG_GLOBAL_CUTOFF_LOOKUP: [u32; 20] = [
    66443, 93504, 104761, 110875, 114707, 117330, 119237, 120686, 121823, 122739, 123493,
    124124, 124660, 125120, 125520, 125871, 126181, 126457, 126704, 126926,
];

/// Lag predictor local cutoff per OSR: the permitted run length of
/// consecutive correct predictions.
const LAG_LOCAL_CUTOFF_LOOKUP: [u32; 20] = [
    38, 75, 111, 146, 181, 215, 250, 284, 318, 351, 385, 419, 452, 485, 518, 551, 584, 617,
    650, 683,
];

/// Observation count granularity of the distribution proportion test.
const DIST_THRESHOLD_WINDOW: u64 = 10_000;
/// Required in-distribution samples per threshold window.
const DIST_THRESHOLD_PER_WINDOW: u64 = 795;

fn lookup<const N: usize>(table: &[u32; N], osr: u32) -> u32 {
    let idx = (osr.max(1) as usize - 1).min(N - 1);
    table[idx]
}

bitflags! {
    /// Health failure bitset. The upper half mirrors the lower half with
    /// permanent failures that never self-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HealthFailure: u32 {
        const RCT = 1 << 0;
        const APT = 1 << 1;
        const LAG = 1 << 2;
        const DIST = 1 << 3;
        const RCT_PERMANENT = 1 << 16;
        const APT_PERMANENT = 1 << 17;
        const LAG_PERMANENT = 1 << 18;
        const DIST_PERMANENT = 1 << 19;
    }
}

impl HealthFailure {
    const PERMANENT_MASK: HealthFailure = HealthFailure::RCT_PERMANENT
        .union(HealthFailure::APT_PERMANENT)
        .union(HealthFailure::LAG_PERMANENT)
        .union(HealthFailure::DIST_PERMANENT);

    /// Map the bitset to the per-read error, in fixed RCT, APT, LAG, DIST
    /// precedence order.
    pub fn as_error(self) -> Option<Error> {
        if self.intersects(HealthFailure::RCT | HealthFailure::RCT_PERMANENT) {
            Some(Error::RctFailure)
        } else if self.intersects(HealthFailure::APT | HealthFailure::APT_PERMANENT) {
            Some(Error::AptFailure)
        } else if self.intersects(HealthFailure::LAG | HealthFailure::LAG_PERMANENT) {
            Some(Error::LagFailure)
        } else if self.intersects(HealthFailure::DIST | HealthFailure::DIST_PERMANENT) {
            Some(Error::DistFailure)
        } else {
            None
        }
    }

    /// Map the bitset to the corresponding initialization-time error.
    pub fn as_init_error(self) -> Option<Error> {
        self.as_error().map(|e| match e {
            Error::RctFailure => Error::Rct,
            Error::AptFailure => Error::Apt,
            Error::LagFailure => Error::Lag,
            Error::DistFailure => Error::Dist,
            _ => Error::Health,
        })
    }
}

/// Bounds of the expected delta sub-distribution, established by the
/// power-up probe. The default covers the full range and disables the test
/// in effect, mirroring the fallback when no probe result is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for DistBounds {
    fn default() -> Self {
        Self {
            min: 0,
            max: u64::MAX,
        }
    }
}

/// Per-collector health test state machine.
pub struct HealthState {
    osr: u32,
    fips_enabled: bool,
    failure: HealthFailure,

    // Stuck test
    last_delta2: u64,

    // Repetition count test
    rct_count: u32,

    // Adaptive proportion test
    apt_cutoff: u32,
    apt_cutoff_permanent: u32,
    apt_base: u64,
    apt_base_set: bool,
    apt_count: u32,
    apt_observations: u32,

    // Lag predictor
    lag_global_cutoff: u32,
    lag_local_cutoff: u32,
    lag_delta_history: [u64; LAG_HISTORY_SIZE],
    lag_scoreboard: [u32; LAG_HISTORY_SIZE],
    lag_best_predictor: usize,
    lag_observations: u32,
    lag_success_count: u32,
    lag_success_run: u32,

    // Distribution proportion test
    dist_bounds: DistBounds,
    dist_observations: u64,
    dist_in_bounds: u64,
}

impl HealthState {
    pub fn new(osr: u32, fips_enabled: bool, dist_bounds: DistBounds) -> Self {
        Self {
            osr,
            fips_enabled,
            failure: HealthFailure::empty(),
            last_delta2: 0,
            rct_count: 0,
            apt_cutoff: lookup(&APT_CUTOFF_LOOKUP, osr),
            apt_cutoff_permanent: lookup(&APT_CUTOFF_PERMANENT_LOOKUP, osr),
            apt_base: 0,
            apt_base_set: false,
            apt_count: 0,
            apt_observations: 0,
            lag_global_cutoff: lookup(&LAG_GLOBAL_CUTOFF_LOOKUP, osr),
            lag_local_cutoff: lookup(&LAG_LOCAL_CUTOFF_LOOKUP, osr),
            lag_delta_history: [0; LAG_HISTORY_SIZE],
            lag_scoreboard: [0; LAG_HISTORY_SIZE],
            lag_best_predictor: 0,
            lag_observations: 0,
            lag_success_count: 0,
            lag_success_run: 0,
            dist_bounds,
            dist_observations: 0,
            dist_in_bounds: 0,
        }
    }

    /// Reset all test state while preserving permanent failures. Used
    /// between the independently-validated NTG.1 startup stages.
    pub fn reset(&mut self) {
        let permanent = self.failure & HealthFailure::PERMANENT_MASK;
        *self = Self::new(self.osr, self.fips_enabled, self.dist_bounds);
        self.failure = permanent;
    }

    /// Clear intermittent failures at the start of a new read attempt.
    /// Permanent bits survive, so a permanently failed collector keeps
    /// failing every read.
    pub fn clear_intermittent(&mut self) {
        self.failure &= HealthFailure::PERMANENT_MASK;
    }

    /// The failure bitset as visible to callers. Health test results are
    /// only binding in FIPS mode.
    pub fn failure(&self) -> HealthFailure {
        if self.fips_enabled {
            self.failure
        } else {
            HealthFailure::empty()
        }
    }

    /// The raw failure bitset regardless of FIPS mode (status reporting).
    pub fn failure_raw(&self) -> HealthFailure {
        self.failure
    }

    pub fn fips_enabled(&self) -> bool {
        self.fips_enabled
    }

    pub fn osr(&self) -> u32 {
        self.osr
    }

    pub fn apt_cutoff(&self) -> u32 {
        self.apt_cutoff
    }

    /// Snapshot of the APT/RCT counters absorbed by the hash-loop noise
    /// source as additional (non-entropy) input.
    pub fn hash_loop_material(&self) -> [u64; 5] {
        [
            self.rct_count as u64,
            self.apt_cutoff as u64,
            self.apt_observations as u64,
            self.apt_count as u64,
            self.apt_base,
        ]
    }

    // -----------------------------------------------------------------------
    // Per-sample pipeline
    // -----------------------------------------------------------------------

    /// Feed one post-GCD delta through all health tests.
    ///
    /// Returns whether the sample is stuck: the first, second or third
    /// discrete derivative of the time is zero. Stuck samples are still
    /// absorbed by the conditioner but do not count toward the credited
    /// sample total.
    pub fn insert(&mut self, delta: u64) -> bool {
        // Second derivative against the most recent delta in the lag
        // predictor history, third against the stored previous second
        // derivative.
        let delta2 = delta.wrapping_sub(self.lag_history_back(0));
        let delta3 = delta2.wrapping_sub(self.last_delta2);
        self.last_delta2 = delta2;

        self.apt_insert(delta);
        self.lag_insert(delta);
        self.dist_insert(delta);

        let stuck = delta == 0 || delta2 == 0 || delta3 == 0;
        self.rct_insert(stuck);
        stuck
    }

    // -----------------------------------------------------------------------
    // Repetition count test (SP800-90B 4.4.1)
    // -----------------------------------------------------------------------

    /// Cutoff C = 1 + ceil(-log2(alpha) / H) with alpha = 2^-30 and
    /// H = 1/osr.
    fn rct_cutoff(&self) -> u32 {
        1 + 30 * self.osr
    }

    fn rct_cutoff_permanent(&self) -> u32 {
        1 + 60 * self.osr
    }

    fn rct_insert(&mut self, stuck: bool) {
        if !stuck {
            self.rct_count = 1;
            return;
        }
        self.rct_count = self.rct_count.saturating_add(1);
        if self.rct_count >= self.rct_cutoff_permanent() {
            self.failure |= HealthFailure::RCT_PERMANENT;
        } else if self.rct_count >= self.rct_cutoff() {
            self.failure |= HealthFailure::RCT;
        }
    }

    // -----------------------------------------------------------------------
    // Adaptive proportion test (SP800-90B 4.4.2)
    // -----------------------------------------------------------------------

    fn apt_insert(&mut self, delta: u64) {
        let symbol = delta & APT_MASK;

        // The reference symbol is the first observation of the window, so a
        // window of 512 holds the base plus 511 comparisons.
        if !self.apt_base_set {
            self.apt_base = symbol;
            self.apt_base_set = true;
            self.apt_observations += 1;
            return;
        }

        if symbol == self.apt_base {
            self.apt_count += 1;
        }

        self.apt_observations += 1;
        if self.apt_observations >= APT_WINDOW_SIZE {
            if self.apt_count >= self.apt_cutoff_permanent {
                self.failure |= HealthFailure::APT_PERMANENT;
            } else if self.apt_count >= self.apt_cutoff {
                self.failure |= HealthFailure::APT;
            }
            self.apt_base_set = false;
            self.apt_count = 0;
            self.apt_observations = 0;
        }
    }

    // -----------------------------------------------------------------------
    // Lag predictor (SP800-90B 6.3.8 family)
    // -----------------------------------------------------------------------

    /// Delta recorded `back + 1` observations ago.
    fn lag_history_back(&self, back: usize) -> u64 {
        let idx = (self.lag_observations as usize).wrapping_sub(back + 1) & LAG_MASK;
        self.lag_delta_history[idx]
    }

    fn lag_reset(&mut self) {
        self.lag_delta_history = [0; LAG_HISTORY_SIZE];
        self.lag_scoreboard = [0; LAG_HISTORY_SIZE];
        self.lag_best_predictor = 0;
        self.lag_observations = 0;
        self.lag_success_count = 0;
        self.lag_success_run = 0;
    }

    fn lag_insert(&mut self, delta: u64) {
        // Fill the history before making predictions.
        if (self.lag_observations as usize) < LAG_HISTORY_SIZE {
            self.lag_delta_history[self.lag_observations as usize] = delta;
            self.lag_observations += 1;
            return;
        }

        let prediction = self.lag_history_back(self.lag_best_predictor);
        if prediction == delta {
            self.lag_success_count += 1;
            self.lag_success_run += 1;

            // Permanent failure at twice the cutoff, mirroring the RCT's
            // intermittent-to-permanent ratio.
            if self.lag_success_count >= 2 * self.lag_global_cutoff
                || self.lag_success_run >= 2 * self.lag_local_cutoff
            {
                self.failure |= HealthFailure::LAG_PERMANENT;
            } else if self.lag_success_count >= self.lag_global_cutoff
                || self.lag_success_run >= self.lag_local_cutoff
            {
                self.failure |= HealthFailure::LAG;
            }
        } else {
            self.lag_success_run = 0;
        }

        // Update the scoreboard; ties go to the shortest lag.
        for i in 0..LAG_HISTORY_SIZE {
            if self.lag_history_back(i) == delta {
                self.lag_scoreboard[i] += 1;
                if self.lag_scoreboard[i] > self.lag_scoreboard[self.lag_best_predictor] {
                    self.lag_best_predictor = i;
                }
            }
        }

        self.lag_delta_history[(self.lag_observations as usize) & LAG_MASK] = delta;
        self.lag_observations += 1;

        if self.lag_observations >= LAG_WINDOW_SIZE {
            self.lag_reset();
        }
    }

    // -----------------------------------------------------------------------
    // Distribution proportion test
    // -----------------------------------------------------------------------

    /// The share of samples falling inside the sub-distribution established
    /// at power-up must stay at or above 795 per 10000 observations.
    fn dist_insert(&mut self, delta: u64) {
        self.dist_observations += 1;
        if delta >= self.dist_bounds.min && delta <= self.dist_bounds.max {
            self.dist_in_bounds += 1;
        }

        let threshold = (self.dist_observations / DIST_THRESHOLD_WINDOW)
            .saturating_mul(DIST_THRESHOLD_PER_WINDOW);
        if threshold == 0 {
            return;
        }
        if self.dist_in_bounds < threshold / 2 {
            self.failure |= HealthFailure::DIST_PERMANENT;
        } else if self.dist_in_bounds < threshold {
            self.failure |= HealthFailure::DIST;
        }
    }
}
