//! The entropy collector: per-sample loop, oversampling, output extraction.
//!
//! One collector owns everything needed to turn timing jitter into seed
//! material: the conditioning sponge, the noise-source state, the health
//! tests and the internal-timer plumbing. A collector must only be driven
//! from one thread at a time; the sole parallel activity is the short-lived
//! counter thread started and joined inside a single [`EntropyCollector::read`]
//! call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::flags::{resolve_memsize_exp, Flags};
use crate::health::{DistBounds, HealthFailure, HealthState};
use crate::init;
use crate::noise::{self, hash_loop, MemoryAccess};
use crate::platform::memzero_explicit;
use crate::sha3::{Sha3, SHA3_256_BLOCK, SHA3_256_DIGEST};
use crate::timer::{self, CounterCell, CounterGuard};

/// Minimum oversampling rate. Lower requested values are raised to this.
pub const MIN_OSR: u32 = 3;

/// Ceiling for the oversampling rate escalation in [`EntropyCollector::read_safe`].
/// The health-test cutoff tables saturate near this point, so raising the
/// OSR further would not reduce the failure rate.
pub const MAX_SAFE_OSR: u32 = 20;

/// Size of one output block in bytes.
pub const BLOCK_SIZE: usize = SHA3_256_DIGEST;

/// Bits collected per output block before oversampling.
const DATA_SIZE_BITS: u32 = 256;

/// Additional samples per block in FIPS mode, compensating the output
/// collision loss of the conditioning function (SP800-90C appendix A.4).
const ENTROPY_SAFETY_FACTOR: u32 = 64;
/// NTG.1 adds one bit for the entropy loss of the SHAKE operation that
/// derives the internal state variable.
const ENTROPY_SAFETY_FACTOR_NTG1: u32 = ENTROPY_SAFETY_FACTOR + 1;

/// Which noise source a raw measurement exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseSource {
    /// Memory access loop followed by the hash loop (production path).
    Combined,
    /// Memory access loop only (NTG.1 startup / raw analysis).
    MemAccess,
    /// Hash loop only (NTG.1 startup / raw analysis).
    HashLoop,
}

/// NTG.1 startup sequencing: each noise source is exercised independently
/// before the combined source is credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartupState {
    Memory,
    Sha3Loop,
    Completed,
}

// ---------------------------------------------------------------------------
// FIPS failure callback
// ---------------------------------------------------------------------------

/// Hook invoked from inside `read` when a health failure is raised in FIPS
/// mode. Receives the failure bitset and the numeric error code about to be
/// returned.
pub type FipsFailureCallback = fn(HealthFailure, i32);

static FIPS_CB: Mutex<Option<FipsFailureCallback>> = Mutex::new(None);
static FIPS_CB_BLOCKED: AtomicBool = AtomicBool::new(false);

/// Register the FIPS failure callback. Must precede `entropy_init`.
pub fn set_fips_failure_callback(cb: FipsFailureCallback) -> Result<(), Error> {
    if FIPS_CB_BLOCKED.load(Ordering::Relaxed) {
        return Err(Error::ProgErr);
    }
    *FIPS_CB.lock().map_err(|_| Error::ProgErr)? = Some(cb);
    Ok(())
}

pub(crate) fn block_callback_switch() {
    FIPS_CB_BLOCKED.store(true, Ordering::Relaxed);
}

fn fire_fips_callback(failure: HealthFailure, code: i32) {
    if let Ok(guard) = FIPS_CB.lock() {
        if let Some(cb) = *guard {
            cb(failure, code);
        }
    }
}

// ---------------------------------------------------------------------------
// Entropy collector
// ---------------------------------------------------------------------------

/// The entropy collector. See the module documentation.
pub struct EntropyCollector {
    pool: Sha3,
    prev_time: u64,
    osr: u32,
    flags: Flags,
    mem: Option<MemoryAccess>,
    memsize_exp: u32,
    hashloopcnt: u64,
    gcd: u64,
    health: HealthState,
    startup_state: StartupState,

    enable_notime: bool,
    counter: Arc<CounterCell>,
    counter_guard: Option<CounterGuard>,
    notime_prev_timer: u64,

    fips_enabled: bool,

    #[cfg(test)]
    test_clock: Option<Box<dyn FnMut() -> u64 + Send>>,
}

impl EntropyCollector {
    /// Allocate a collector and run one priming block.
    ///
    /// Runs the power-up self-tests first if no successful `entropy_init`
    /// has happened in this process yet.
    pub fn new(osr: u32, flags: Flags) -> Result<Self, Error> {
        // Requesting disabling and forcing of the internal timer at the
        // same time makes no sense.
        if flags.contains(Flags::DISABLE_INTERNAL_TIMER | Flags::FORCE_INTERNAL_TIMER) {
            return Err(Error::ProgErr);
        }

        init::ensure_selftest(osr, flags)?;

        // If initialization concluded that only the internal timer works
        // but the caller forbids it, there is no usable time source.
        if init::internal_timer_forced() && flags.contains(Flags::DISABLE_INTERNAL_TIMER) {
            return Err(Error::NoTime);
        }

        let mut ec = Self::alloc_internal(osr, flags)?;
        ec.prime()?;
        Ok(ec)
    }

    /// Allocation without self-test gating or priming; shared by `new` and
    /// the power-up probe.
    pub(crate) fn alloc_internal(osr: u32, flags: Flags) -> Result<Self, Error> {
        if flags.contains(Flags::DISABLE_INTERNAL_TIMER | Flags::FORCE_INTERNAL_TIMER) {
            return Err(Error::ProgErr);
        }

        let memsize_exp = resolve_memsize_exp(flags);
        let mem = if flags.contains(Flags::DISABLE_MEMORY_ACCESS) {
            None
        } else {
            Some(MemoryAccess::new(memsize_exp))
        };

        let fips_enabled =
            flags.contains(Flags::FORCE_FIPS) || crate::platform::fips_enabled();

        let (gcd, dist_bounds) = match init::state() {
            Some(s) => (s.gcd, s.dist_bounds),
            // Without a committed initialization the divisor is neutral and
            // the distribution bounds are meaningless; widen them so the
            // test cannot misfire.
            None => (1, DistBounds::default()),
        };

        let enable_notime = !flags.contains(Flags::DISABLE_INTERNAL_TIMER)
            && (flags.contains(Flags::FORCE_INTERNAL_TIMER) || init::internal_timer_forced());

        let osr = osr.max(MIN_OSR);

        let ec = Self {
            pool: Sha3::pool(),
            prev_time: 0,
            osr,
            flags,
            mem,
            memsize_exp,
            hashloopcnt: noise::HASH_LOOP_DEFAULT,
            gcd,
            health: HealthState::new(osr, fips_enabled, dist_bounds),
            startup_state: if flags.contains(Flags::NTG1) {
                StartupState::Memory
            } else {
                StartupState::Completed
            },
            enable_notime,
            counter: Arc::new(CounterCell::new()),
            counter_guard: None,
            notime_prev_timer: 0,
            fips_enabled,
            #[cfg(test)]
            test_clock: None,
        };
        Ok(ec)
    }

    /// Throwaway collector for the power-up probe: FIPS is forced so the
    /// start-up health tests are binding, the divisor is neutral so the
    /// probe sees raw deltas, and the distribution bounds are wide open
    /// because the probe is what establishes them.
    pub(crate) fn probe(osr: u32, flags: Flags) -> Result<Self, Error> {
        let mut ec = Self::alloc_internal(osr, flags | Flags::FORCE_FIPS)
            .map_err(|_| Error::Mem)?;
        ec.gcd = 1;
        ec.health = HealthState::new(ec.osr, true, DistBounds::default());
        Ok(ec)
    }

    /// One combined measurement for the power-up probe.
    pub(crate) fn probe_measure(&mut self) -> (bool, u64) {
        self.measure_jitter_ret(0)
    }

    /// Priming block: fills the sponge once so the collector never hands
    /// out its very first measurements.
    fn prime(&mut self) -> Result<(), Error> {
        self.settick()?;
        self.random_data();
        self.unsettick();

        if let Some(err) = self.health.failure().as_init_error() {
            return Err(err);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn osr(&self) -> u32 {
        self.osr
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn fips_enabled(&self) -> bool {
        self.fips_enabled
    }

    pub fn internal_timer(&self) -> bool {
        self.enable_notime
    }

    /// Working set size of the memory access source, 0 when disabled.
    pub fn memory_size(&self) -> usize {
        self.mem.as_ref().map(|m| m.size()).unwrap_or(0)
    }

    pub fn hash_loop_count(&self) -> u64 {
        self.hashloopcnt
    }

    /// Current health failure bitset as visible to callers.
    pub fn health_failure(&self) -> HealthFailure {
        self.health.failure()
    }

    /// Raw health bitset regardless of FIPS mode, for status reporting.
    pub fn health_failure_raw(&self) -> HealthFailure {
        self.health.failure_raw()
    }

    /// Divide raw ticks out as if the timer had no common divisor. Only
    /// meant for raw-entropy measurement tooling.
    pub fn set_raw_tick_reporting(&mut self, enable: bool) {
        if enable {
            self.gcd = 1;
        } else if let Some(s) = init::state() {
            self.gcd = s.gcd;
        }
    }

    pub(crate) fn prev_time_for_probe(&self) -> u64 {
        self.prev_time
    }

    // -----------------------------------------------------------------------
    // Time acquisition
    // -----------------------------------------------------------------------

    fn next_time(&mut self) -> u64 {
        #[cfg(test)]
        if let Some(clock) = self.test_clock.as_mut() {
            return clock();
        }
        if self.enable_notime {
            self.counter.wait_next(&mut self.notime_prev_timer)
        } else {
            crate::platform::now_ticks()
        }
    }

    /// Start the internal timer thread if this collector uses it.
    pub(crate) fn settick(&mut self) -> Result<(), Error> {
        #[cfg(test)]
        if self.test_clock.is_some() {
            return Ok(());
        }
        if !self.enable_notime || self.counter_guard.is_some() {
            return Ok(());
        }
        self.notime_prev_timer = 0;
        let guard = timer::start_counter(Arc::clone(&self.counter))?;
        self.counter_guard = Some(guard);
        Ok(())
    }

    /// Interrupt and join the internal timer thread.
    pub(crate) fn unsettick(&mut self) {
        self.counter_guard.take();
    }

    // -----------------------------------------------------------------------
    // Per-sample measurement
    // -----------------------------------------------------------------------

    /// Absorb one sample into the pool: the intermediary buffer is exactly
    /// one sponge rate in size, so every sample costs exactly one Keccak
    /// compression regardless of whether it was stuck.
    fn pool_insert(&mut self, digest: &[u8; SHA3_256_DIGEST], delta: u64) {
        let mut intermediary = [0u8; SHA3_256_BLOCK];
        intermediary[..SHA3_256_DIGEST].copy_from_slice(digest);
        intermediary[SHA3_256_DIGEST..SHA3_256_DIGEST + 8]
            .copy_from_slice(&delta.to_le_bytes());
        self.pool.update(&intermediary);
        memzero_explicit(&mut intermediary);
    }

    /// One combined-source measurement. Returns the stuck verdict and the
    /// post-GCD delta.
    ///
    /// `prev_time` must be primed before the result is used; priming is one
    /// call whose result is discarded.
    fn measure_jitter_ret(&mut self, loop_cnt: u64) -> (bool, u64) {
        if let Some(mem) = self.mem.as_mut() {
            mem.run(loop_cnt);
        }

        let time_now = self.next_time();
        let delta = time_now.wrapping_sub(self.prev_time) / self.gcd;
        self.prev_time = time_now;

        let stuck = self.health.insert(delta);

        let mut digest = [0u8; SHA3_256_DIGEST];
        hash_loop(&self.health, loop_cnt, &mut digest);
        self.pool_insert(&digest, delta);
        memzero_explicit(&mut digest);

        (stuck, delta)
    }

    fn measure_jitter(&mut self, loop_cnt: u64) -> bool {
        self.measure_jitter_ret(loop_cnt).0
    }

    /// Memory-access-only measurement for NTG.1 startup: the timestamps
    /// bracket nothing but the memory walk, making it an independently
    /// validated entropy source.
    fn measure_jitter_memaccess_ret(&mut self, loop_cnt: u64) -> (bool, u64) {
        self.prev_time = self.next_time();

        let cnt = if loop_cnt != 0 {
            loop_cnt
        } else {
            noise::MEM_ACC_LOOP_DEFAULT * noise::NOISE_LOOP_INIT_MULTIPLIER
        };
        if let Some(mem) = self.mem.as_mut() {
            mem.run(cnt);
        }

        let time_now = self.next_time();
        let delta = time_now.wrapping_sub(self.prev_time) / self.gcd;

        let stuck = self.health.insert(delta);
        let digest = [0u8; SHA3_256_DIGEST];
        self.pool_insert(&digest, delta);

        (stuck, delta)
    }

    fn measure_jitter_memaccess(&mut self, loop_cnt: u64) -> bool {
        self.measure_jitter_memaccess_ret(loop_cnt).0
    }

    /// Hash-loop-only measurement for NTG.1 startup.
    fn measure_jitter_hashloop_ret(&mut self, loop_cnt: u64) -> (bool, u64) {
        self.prev_time = self.next_time();

        let cnt = if loop_cnt != 0 {
            loop_cnt
        } else {
            self.hashloopcnt * noise::NOISE_LOOP_INIT_MULTIPLIER
        };
        let mut digest = [0u8; SHA3_256_DIGEST];
        hash_loop(&self.health, cnt, &mut digest);

        let time_now = self.next_time();
        let delta = time_now.wrapping_sub(self.prev_time) / self.gcd;

        let stuck = self.health.insert(delta);
        self.pool_insert(&digest, delta);
        memzero_explicit(&mut digest);

        (stuck, delta)
    }

    fn measure_jitter_hashloop(&mut self, loop_cnt: u64) -> bool {
        self.measure_jitter_hashloop_ret(loop_cnt).0
    }

    // -----------------------------------------------------------------------
    // Block generation
    // -----------------------------------------------------------------------

    fn safety_factor(&self) -> u32 {
        if !self.fips_enabled {
            return 0;
        }
        if self.flags.contains(Flags::NTG1) {
            ENTROPY_SAFETY_FACTOR_NTG1
        } else {
            ENTROPY_SAFETY_FACTOR
        }
    }

    /// Collect stuck-free samples for one 256-bit block, multiplied by the
    /// oversampling rate. Stuck samples are absorbed but repeated; health
    /// failures abort the loop.
    fn random_data_one(&mut self, measure: fn(&mut Self, u64) -> bool) {
        let required = (DATA_SIZE_BITS + self.safety_factor()) * self.osr;
        let mut k = 0u32;

        while self.health.failure().is_empty() {
            if measure(self, 0) {
                continue;
            }
            k += 1;
            if k >= required {
                break;
            }
        }
    }

    /// Fill the pool for one output block, honoring the NTG.1 startup
    /// sequence: each noise source runs alone once, with the health tests
    /// re-initialized in between, before the combined source takes over.
    fn random_data(&mut self) {
        match self.startup_state {
            StartupState::Memory => {
                self.random_data_one(Self::measure_jitter_memaccess);
                self.health.reset();
                self.startup_state = StartupState::Sha3Loop;

                self.random_data_one(Self::measure_jitter_hashloop);
                self.health.reset();
                self.startup_state = StartupState::Completed;
            }
            StartupState::Sha3Loop => {
                self.random_data_one(Self::measure_jitter_hashloop);
                self.health.reset();
                self.startup_state = StartupState::Completed;
            }
            StartupState::Completed => {
                // Priming of prev_time; the result is discarded.
                self.measure_jitter(0);
                self.random_data_one(Self::measure_jitter);
            }
        }
    }

    /// Squeeze one block out of the pool. The extractor reseeds the sponge
    /// with its fresh state, so a later memory disclosure reveals nothing
    /// about bytes already returned.
    fn read_random_block(&mut self, dst: &mut [u8]) {
        self.pool.drbg_generate(dst);
    }

    // -----------------------------------------------------------------------
    // Public read paths
    // -----------------------------------------------------------------------

    /// Fill `buf` with entropy. Returns the number of bytes written
    /// (always `buf.len()` on success) or the first health failure hit.
    ///
    /// Intermittent failures leave the collector usable; a permanent
    /// failure makes every subsequent read return the same error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.health.clear_intermittent();
        self.settick()?;
        let result = self.read_blocks(buf);
        self.unsettick();
        result
    }

    fn read_blocks(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut offset = 0;

        while offset < buf.len() {
            self.random_data();

            let failure = self.health.failure();
            if let Some(err) = failure.as_error() {
                fire_fips_callback(failure, err.code());
                log::warn!("health test failure during read: {err}");
                return Err(err);
            }

            let todo = (buf.len() - offset).min(BLOCK_SIZE);
            let mut block = [0u8; BLOCK_SIZE];
            self.read_random_block(&mut block);
            buf[offset..offset + todo].copy_from_slice(&block[..todo]);
            memzero_explicit(&mut block);
            offset += todo;
        }

        // One discard squeeze: the pool state after this point no longer
        // allows reconstructing the bytes just handed out.
        self.read_random_block(&mut []);

        Ok(buf.len())
    }

    /// As [`read`](Self::read), but recovers from intermittent health
    /// failures by re-running the power-up tests and rebuilding the
    /// collector with the oversampling rate raised by one (and one more
    /// step of memory), up to OSR 20.
    pub fn read_safe(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut offset = 0;

        while offset < buf.len() {
            match self.read(&mut buf[offset..]) {
                Ok(n) => offset += n,
                Err(err) if err.is_recoverable_health_failure() => {
                    let osr = self.osr + 1;
                    if osr > MAX_SAFE_OSR {
                        return Err(err);
                    }
                    log::info!(
                        "health failure {err}; reallocating with osr {osr} (was {})",
                        self.osr
                    );
                    let flags = self.flags.bump_max_memsize(self.memsize_exp);

                    // Re-run the power-up health test with the new OSR
                    // before trusting the reallocated collector.
                    init::entropy_init_ex(osr, flags)?;
                    *self = Self::new(osr, flags)?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(buf.len())
    }

    // -----------------------------------------------------------------------
    // Raw measurement interface (entropy assessment tooling)
    // -----------------------------------------------------------------------

    /// Record `rounds` raw per-sample deltas from the chosen noise source.
    ///
    /// This is the data-collection interface for SP800-90B entropy
    /// assessment; the stuck verdict is deliberately ignored so the
    /// recorded series shows the unfiltered distribution.
    pub fn record_raw_deltas(
        &mut self,
        source: NoiseSource,
        rounds: usize,
        loop_cnt: u64,
    ) -> Result<Vec<u64>, Error> {
        self.settick()?;

        let mut deltas = Vec::with_capacity(rounds);
        if source == NoiseSource::Combined {
            // Prime prev_time for the span-measuring combined source.
            self.measure_jitter_ret(loop_cnt);
        }
        for _ in 0..rounds {
            let (_, delta) = match source {
                NoiseSource::Combined => self.measure_jitter_ret(loop_cnt),
                NoiseSource::MemAccess => self.measure_jitter_memaccess_ret(loop_cnt),
                NoiseSource::HashLoop => self.measure_jitter_hashloop_ret(loop_cnt),
            };
            deltas.push(delta);
        }

        self.unsettick();
        Ok(deltas)
    }

    // -----------------------------------------------------------------------
    // Test hooks
    // -----------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn set_test_clock(&mut self, clock: Box<dyn FnMut() -> u64 + Send>) {
        self.test_clock = Some(clock);
    }

    #[cfg(test)]
    pub(crate) fn scramble_prng_for_test(&mut self, tweak: u64) {
        if let Some(mem) = self.mem.as_mut() {
            mem.scramble_prng_for_test(tweak);
        }
    }

    #[cfg(test)]
    pub(crate) fn run_priming_for_test(&mut self) -> Result<(), Error> {
        self.prime()
    }
}

impl Drop for EntropyCollector {
    fn drop(&mut self) {
        self.unsettick();
        // The sponge and the working set wipe themselves; clear the scalar
        // remnants of the timing state as well.
        self.prev_time = 0;
        self.notime_prev_timer = 0;
        self.health.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collector with a scripted clock, neutral divisor, wide-open
    /// distribution bounds and forced FIPS.
    fn scripted_collector(
        osr: u32,
        flags: Flags,
        clock: Box<dyn FnMut() -> u64 + Send>,
    ) -> EntropyCollector {
        let mut ec = EntropyCollector::probe(osr, flags).expect("alloc failed");
        ec.set_test_clock(clock);
        ec
    }

    /// Clock advancing by an irregular, never-stuck pattern.
    fn jittery_clock() -> Box<dyn FnMut() -> u64 + Send> {
        let mut t = 1000u64;
        let mut x = 0x2545f4914f6cdd1du64;
        Box::new(move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            t = t.wrapping_add(50 + (x % 1999));
            t
        })
    }

    #[test]
    fn test_read_fills_exact_length() {
        let mut ec = scripted_collector(3, Flags::empty(), jittery_clock());
        ec.run_priming_for_test().expect("priming failed");

        for len in [1usize, 16, 32, 33, 100] {
            let mut buf = vec![0u8; len];
            assert_eq!(ec.read(&mut buf), Ok(len));
        }
    }

    #[test]
    fn test_read_output_nonzero_and_distinct() {
        let mut ec = scripted_collector(3, Flags::empty(), jittery_clock());
        ec.run_priming_for_test().unwrap();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        ec.read(&mut a).unwrap();
        ec.read(&mut b).unwrap();
        assert_ne!(a, [0u8; 32]);
        assert_ne!(a, b, "consecutive reads must differ");
    }

    #[test]
    fn test_different_clocks_different_output() {
        let mut ec1 = scripted_collector(3, Flags::empty(), jittery_clock());
        ec1.run_priming_for_test().unwrap();

        let mut t = 0u64;
        let mut ec2 = scripted_collector(
            3,
            Flags::empty(),
            Box::new(move || {
                t = t.wrapping_add(97 + (t % 43));
                t
            }),
        );
        ec2.run_priming_for_test().unwrap();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        ec1.read(&mut a).unwrap();
        ec2.read(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_prng_state_does_not_influence_output() {
        // Two collectors fed the identical delta sequence but walking
        // memory at different addresses must emit identical bytes: the
        // address PRNG only decides where the noise loop touches memory,
        // never what enters the sponge.
        let mut ec1 = scripted_collector(3, Flags::empty(), jittery_clock());
        let mut ec2 = scripted_collector(3, Flags::empty(), jittery_clock());
        ec2.scramble_prng_for_test(0xdeadbeef);

        ec1.run_priming_for_test().unwrap();
        ec2.run_priming_for_test().unwrap();

        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        ec1.read(&mut a).unwrap();
        ec2.read(&mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_stuck_timer_returns_rct_failure() {
        // A timer frozen after priming produces all-zero deltas: every
        // sample is stuck and the RCT must abort the read.
        let mut ec = scripted_collector(3, Flags::empty(), Box::new(|| 123_456));
        // Skip priming through the public path; prev_time gets the frozen
        // value on the first sample.
        let mut buf = [0u8; 32];
        assert_eq!(ec.read(&mut buf), Err(Error::RctFailure));
    }

    #[test]
    fn test_rct_failure_code_is_minus_two() {
        let mut ec = scripted_collector(3, Flags::empty(), Box::new(|| 99));
        let mut buf = [0u8; 32];
        let err = ec.read(&mut buf).unwrap_err();
        assert_eq!(err.code(), -2);
    }

    #[test]
    fn test_intermittent_failure_leaves_collector_usable() {
        // First read against a frozen clock fails; swapping in a healthy
        // clock afterwards must succeed because intermittent bits clear at
        // the next read attempt.
        let frozen = std::sync::Arc::new(AtomicBool::new(true));
        let gate = std::sync::Arc::clone(&frozen);
        let mut inner = jittery_clock();
        let mut ec = scripted_collector(
            3,
            Flags::empty(),
            Box::new(move || {
                if gate.load(Ordering::Relaxed) {
                    777
                } else {
                    inner()
                }
            }),
        );

        let mut buf = [0u8; 32];
        assert_eq!(ec.read(&mut buf), Err(Error::RctFailure));

        frozen.store(false, Ordering::Relaxed);
        assert_eq!(ec.read(&mut buf), Ok(32));
    }

    #[test]
    fn test_gcd_divides_deltas() {
        // Clock stepping in multiples of 17 with the divisor set: the
        // recorded raw deltas must come out divided.
        let mut t = 0u64;
        let mut x = 1u64;
        let mut ec = scripted_collector(
            3,
            Flags::empty(),
            Box::new(move || {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
                t = t.wrapping_add(if x & 1 == 0 { 17 } else { 34 });
                t
            }),
        );
        ec.gcd = 17;

        let deltas = ec
            .record_raw_deltas(NoiseSource::Combined, 200, 0)
            .unwrap();
        assert!(deltas.iter().all(|&d| d == 1 || d == 2), "deltas: {deltas:?}");
    }

    #[test]
    fn test_ntg1_startup_transitions_to_completed() {
        let mut ec = scripted_collector(3, Flags::NTG1, jittery_clock());
        assert_eq!(ec.startup_state, StartupState::Memory);
        ec.run_priming_for_test().unwrap();
        assert_eq!(ec.startup_state, StartupState::Completed);

        let mut buf = [0u8; 32];
        assert_eq!(ec.read(&mut buf), Ok(32));
    }

    #[test]
    fn test_disable_memory_access() {
        let mut ec = scripted_collector(
            3,
            Flags::DISABLE_MEMORY_ACCESS,
            jittery_clock(),
        );
        assert_eq!(ec.memory_size(), 0);
        ec.run_priming_for_test().unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(ec.read(&mut buf), Ok(32));
    }

    #[test]
    fn test_conflicting_timer_flags_rejected() {
        let r = EntropyCollector::alloc_internal(
            3,
            Flags::DISABLE_INTERNAL_TIMER | Flags::FORCE_INTERNAL_TIMER,
        );
        assert!(matches!(r, Err(Error::ProgErr)));
    }

    #[test]
    fn test_osr_clamped_to_minimum() {
        let ec = EntropyCollector::alloc_internal(1, Flags::empty()).unwrap();
        assert_eq!(ec.osr(), MIN_OSR);
    }

    #[test]
    fn test_record_raw_deltas_per_source() {
        for source in [NoiseSource::Combined, NoiseSource::MemAccess, NoiseSource::HashLoop] {
            let mut ec = scripted_collector(3, Flags::empty(), jittery_clock());
            let deltas = ec.record_raw_deltas(source, 64, 0).unwrap();
            assert_eq!(deltas.len(), 64);
            assert!(deltas.iter().any(|&d| d != 0));
        }
    }

    #[test]
    fn test_read_zero_length() {
        let mut ec = scripted_collector(3, Flags::empty(), jittery_clock());
        ec.run_priming_for_test().unwrap();
        let mut buf: [u8; 0] = [];
        assert_eq!(ec.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_oversampling_sample_count() {
        // In FIPS mode one 256-bit block consumes exactly
        // 1 (priming) + (256 + 64) * osr stuck-free samples; the combined
        // source reads the clock once per sample. Quadratically growing
        // deltas keep all three discrete derivatives nonzero, so no sample
        // is ever stuck and the count is exact.
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let counter = std::sync::Arc::clone(&calls);
        let mut t = 0u64;
        let mut n = 0u64;
        let mut ec = scripted_collector(
            3,
            Flags::empty(),
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                n += 1;
                t = t.wrapping_add(1000 + n * n);
                t
            }),
        );

        let mut buf = [0u8; 32];
        ec.read(&mut buf).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1 + (256 + 64) * 3);
    }

    #[test]
    fn test_read_safe_happy_path() {
        let mut ec = scripted_collector(3, Flags::empty(), jittery_clock());
        ec.run_priming_for_test().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(ec.read_safe(&mut buf), Ok(64));
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_stuck_samples_still_absorb() {
        // Two collectors see the same number of pool insertions even though
        // one receives stuck samples in the middle: squeeze after the same
        // count of samples, the sponge states differ only by the absorbed
        // delta values, not by block count. Verified indirectly: a stuck-
        // heavy collector still produces output once healthy samples
        // resume, without the RCT having fired below its cutoff.
        let mut step = 0u32;
        let mut t = 5_000u64;
        let mut x = 0x9e3779b97f4a7c15u64;
        let mut last_step = 100u64;
        let mut ec = scripted_collector(
            3,
            Flags::empty(),
            Box::new(move || {
                step += 1;
                // Every 8th sample repeats the previous delta (stuck via
                // second derivative), others jitter.
                if step % 8 != 0 {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    last_step = 100 + (x % 997);
                }
                t = t.wrapping_add(last_step);
                t
            }),
        );
        ec.run_priming_for_test().unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(ec.read(&mut buf), Ok(32));
    }
}
