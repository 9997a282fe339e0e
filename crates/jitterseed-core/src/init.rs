//! Power-up self-tests and process-global initialization state.
//!
//! `entropy_init` (and the parameterized `entropy_init_ex`) must succeed
//! once per process before collectors hand out entropy. The sequence is:
//! SHA-3 known-answer tests, GCD analyzer self-test, then a probe run of
//! 1024 measurements through a throwaway collector that validates the time
//! source (presence, resolution, monotonicity, stuck ratio) and derives the
//! common timer divisor. The first successful probe commits an immutable
//! [`InitState`]; collectors cache a copy at construction so the hot path
//! never touches global state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::collector::{self, EntropyCollector};
use crate::error::Error;
use crate::flags::Flags;
use crate::gcd::{self, DeltaHistory};
use crate::health::DistBounds;
use crate::sha3;
use crate::timer;

/// SP800-90B requires at least 1024 initial test cycles.
const POWERUP_TESTLOOPCOUNT: usize = 1024;

/// Measurements discarded up front so caches and branch predictors are
/// warmed into their worst-case steady state before anything is evaluated.
const CLEARCACHE: usize = 100;

/// More than 90% stuck measurements during the probe disqualify the timer.
fn stuck_init_threshold(n: usize) -> usize {
    (n * 9) / 10
}

/// Initialize-once snapshot committed by the first successful probe.
pub(crate) struct InitState {
    /// Common divisor of all timer deltas.
    pub gcd: u64,
    /// Whether the probe concluded that only the internal timer works.
    pub force_internal: bool,
    /// Expected delta sub-distribution for the runtime distribution test.
    pub dist_bounds: DistBounds,
}

static INIT_STATE: OnceLock<InitState> = OnceLock::new();
static SELFTEST_RUN: AtomicBool = AtomicBool::new(false);

pub(crate) fn state() -> Option<&'static InitState> {
    INIT_STATE.get()
}

/// Whether initialization selected the internal timer.
pub(crate) fn internal_timer_forced() -> bool {
    state().map(|s| s.force_internal).unwrap_or(false)
}

/// Run the self-tests on behalf of a collector allocation if no successful
/// `entropy_init` has happened yet.
pub(crate) fn ensure_selftest(osr: u32, flags: Flags) -> Result<(), Error> {
    if SELFTEST_RUN.load(Ordering::Relaxed) {
        return Ok(());
    }
    entropy_init_ex(osr, flags)
}

// ---------------------------------------------------------------------------
// Public initialization entry points
// ---------------------------------------------------------------------------

/// Run all power-up self-tests with default parameters.
///
/// Idempotent after the first success; repeated calls re-run the tests but
/// the committed timer divisor and timer selection are immutable.
pub fn entropy_init() -> Result<(), Error> {
    entropy_init_ex(0, Flags::empty())
}

/// Run all power-up self-tests with a caller-chosen oversampling rate and
/// flags.
pub fn entropy_init_ex(osr: u32, flags: Flags) -> Result<(), Error> {
    init_common_pre()?;

    let mut ret = Err(Error::NoTime);

    // Hardware timer first, unless the caller insists on the internal one.
    if !flags.contains(Flags::FORCE_INTERNAL_TIMER) {
        ret = time_entropy_init(osr, (flags - Flags::FORCE_INTERNAL_TIMER)
            | Flags::DISABLE_INTERNAL_TIMER);
    }

    // Fall back to the internal timer when permitted.
    if ret.is_err() && !flags.contains(Flags::DISABLE_INTERNAL_TIMER) {
        ret = time_entropy_init(osr, (flags - Flags::DISABLE_INTERNAL_TIMER)
            | Flags::FORCE_INTERNAL_TIMER);
    }

    init_common_post(ret)
}

fn init_common_pre() -> Result<(), Error> {
    // Lock the pluggable pieces before anything depends on them.
    timer::block_switch();
    collector::block_callback_switch();

    sha3::self_test()?;
    gcd::self_test()?;

    SELFTEST_RUN.store(true, Ordering::Relaxed);
    Ok(())
}

fn init_common_post(ret: Result<(), Error>) -> Result<(), Error> {
    if ret.is_err() {
        SELFTEST_RUN.store(false, Ordering::Relaxed);
    }
    ret
}

// ---------------------------------------------------------------------------
// Timer probe
// ---------------------------------------------------------------------------

/// Exercise a throwaway collector and validate the time source.
fn time_entropy_init(osr: u32, flags: Flags) -> Result<(), Error> {
    let use_internal = flags.contains(Flags::FORCE_INTERNAL_TIMER);
    let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);

    // The start-up health tests must run even outside FIPS environments;
    // the probe collector forces FIPS mode for that reason.
    let mut ec = EntropyCollector::probe(osr, flags)?;

    ec.settick()?;
    let result = powerup_probe(&mut ec, &mut history);
    ec.unsettick();
    drop(ec);

    let (gcd_value, dist_bounds) = result?;

    // First success wins; later runs only confirm.
    let _ = INIT_STATE.set(InitState {
        gcd: gcd_value,
        force_internal: use_internal,
        dist_bounds,
    });

    log::debug!(
        "power-up probe passed: gcd {gcd_value}, internal timer {use_internal}"
    );
    Ok(())
}

/// The 1024-round measurement loop shared by both timer modes.
///
/// Returns the discovered timer divisor and the observed delta
/// sub-distribution bounds.
pub(crate) fn powerup_probe(
    ec: &mut EntropyCollector,
    history: &mut DeltaHistory,
) -> Result<(u64, DistBounds), Error> {
    let rounds = history.len();
    let mut time_backwards = 0u32;
    let mut count_stuck = 0usize;

    // Priming of prev_time; the result is discarded.
    ec.probe_measure();

    for i in 0..(CLEARCACHE + rounds) {
        let (stuck, delta) = ec.probe_measure();
        let end_time = ec.prev_time_for_probe();
        let start_time = end_time.wrapping_sub(delta);

        // The timer must exist at all.
        if start_time == 0 || end_time == 0 {
            return Err(Error::NoTime);
        }

        // The timer must be fine-grained enough to show a difference
        // between two closely spaced reads.
        if delta == 0 || end_time == start_time {
            return Err(Error::CoarseTime);
        }

        // The work up to here already disturbed caches and branch
        // prediction; only now do the measurements count.
        if i < CLEARCACHE {
            continue;
        }

        if stuck {
            count_stuck += 1;
        }

        // CLOCK adjustments (adjtime, NTP) may step the time backwards; a
        // small number of occurrences is tolerated below.
        if end_time <= start_time {
            time_backwards += 1;
        }

        history.record(i - CLEARCACHE, delta);
    }

    if time_backwards > 3 {
        return Err(Error::NonMonotonic);
    }

    if let Some(err) = ec.health_failure().as_init_error() {
        return Err(err);
    }

    let gcd_value = history.analyze()?;

    if count_stuck > stuck_init_threshold(rounds) {
        return Err(Error::Stuck);
    }

    // Establish the runtime distribution-test bounds from the observed
    // post-divisor deltas, widening the upper end so ordinary load shifts
    // stay inside.
    let mut min = u64::MAX;
    let mut max = 0u64;
    for &raw in history.as_slice() {
        let v = raw / gcd_value;
        min = min.min(v);
        max = max.max(v);
    }
    let dist_bounds = DistBounds {
        min,
        max: max.saturating_mul(4),
    };

    Ok((gcd_value, dist_bounds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_collector(clock: Box<dyn FnMut() -> u64 + Send>) -> EntropyCollector {
        let mut ec = EntropyCollector::probe(3, Flags::DISABLE_INTERNAL_TIMER)
            .expect("probe alloc failed");
        ec.set_test_clock(clock);
        ec
    }

    #[test]
    fn test_probe_discovers_timer_divisor() {
        // Deltas drawn pseudo-randomly from {17, 34}: the probe must pass
        // and record a divisor of 17.
        let mut t = 1_000u64;
        let mut x = 0x853c49e6748fea9bu64;
        let mut ec = probe_collector(Box::new(move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            t = t.wrapping_add(if x & 1 == 0 { 17 } else { 34 });
            t
        }));

        let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);
        let (gcd_value, bounds) = powerup_probe(&mut ec, &mut history).expect("probe failed");
        assert_eq!(gcd_value, 17);
        assert_eq!(bounds.min, 1);
        assert_eq!(bounds.max, 2 * 4);
    }

    #[test]
    fn test_probe_rejects_coarse_timer() {
        // Every delta a multiple of 100: the divisor discovery must reject
        // the timer as too coarse.
        let mut t = 500u64;
        let mut x = 0x9e3779b97f4a7c15u64;
        let mut ec = probe_collector(Box::new(move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            t = t.wrapping_add(100 * (1 + (x % 5)));
            t
        }));

        let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);
        assert_eq!(
            powerup_probe(&mut ec, &mut history),
            Err(Error::CoarseTime)
        );
    }

    #[test]
    fn test_probe_rejects_dead_timer() {
        let mut ec = probe_collector(Box::new(|| 0));
        let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);
        assert_eq!(powerup_probe(&mut ec, &mut history), Err(Error::NoTime));
    }

    #[test]
    fn test_probe_rejects_frozen_timer() {
        // Nonzero but frozen: the first counted measurement has delta 0.
        let mut ec = probe_collector(Box::new(|| 42_000));
        let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);
        assert_eq!(powerup_probe(&mut ec, &mut history), Err(Error::CoarseTime));
    }

    #[test]
    fn test_probe_rejects_backwards_timer() {
        // Timer stepping backwards on every 50th read, more than three
        // times across the probe window.
        let mut n = 0u64;
        let mut t = 1_000_000u64;
        let mut x = 0x2545f4914f6cdd1du64;
        let mut ec = probe_collector(Box::new(move || {
            n += 1;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if n % 50 == 0 {
                t = t.wrapping_sub(5_000 + (x % 100));
            } else {
                t = t.wrapping_add(30 + (x % 200));
            }
            t
        }));

        let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);
        assert_eq!(
            powerup_probe(&mut ec, &mut history),
            Err(Error::NonMonotonic)
        );
    }

    #[test]
    fn test_probe_passes_on_jittery_timer() {
        let mut t = 10_000u64;
        let mut x = 0xda942042e4dd58b5u64;
        let mut ec = probe_collector(Box::new(move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            t = t.wrapping_add(20 + (x % 977));
            t
        }));

        let mut history = DeltaHistory::new(POWERUP_TESTLOOPCOUNT);
        let (gcd_value, bounds) = powerup_probe(&mut ec, &mut history).expect("probe failed");
        assert_eq!(gcd_value, 1);
        assert!(bounds.min >= 20);
        assert!(bounds.max >= bounds.min);
    }

    #[test]
    fn test_stuck_threshold() {
        assert_eq!(stuck_init_threshold(1024), 921);
        assert_eq!(stuck_init_threshold(10), 9);
    }
}
