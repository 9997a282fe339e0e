//! # jitterseed-core
//!
//! **A non-physical true random number generator built on CPU execution-time
//! jitter.**
//!
//! `jitterseed-core` measures the execution time of deterministic workloads
//! (a volatile memory walk and a SHA3-256 hash loop) with the platform's
//! highest-resolution counter. The unpredictable wait states, pipeline
//! effects and clock interactions of a modern CPU make each timing delta
//! carry a small amount of true entropy; the deltas run through the
//! SP800-90B health tests (repetition count, adaptive proportion, lag
//! predictor, distribution proportion) and are conditioned in a Keccak
//! sponge. Output blocks come out of an XDRBG extractor that reseeds the
//! sponge on every squeeze for backtracking resistance.
//!
//! This is a *seed source*, not a stream generator: feed its output into a
//! DRBG. It uses no OS entropy and keeps no persistent state.
//!
//! ## Quick Start
//!
//! ```no_run
//! use jitterseed_core::{entropy_init, EntropyCollector, Flags};
//!
//! // Validate the time source and the crypto once per process.
//! entropy_init().expect("no usable high-resolution timer");
//!
//! // Allocate a collector and pull a seed.
//! let mut ec = EntropyCollector::new(3, Flags::empty()).unwrap();
//! let mut seed = [0u8; 32];
//! ec.read_safe(&mut seed).unwrap();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! memaccess -> timestamp delta -> GCD factor-out -> stuck test ->
//! health tests -> hash loop -> sponge absorb -> (repeat osr*(256+safety))
//! -> XDRBG squeeze 256 bit -> reseed sponge
//! ```
//!
//! The only background activity is the optional internal timer thread,
//! started and joined within one `read` call on machines whose hardware
//! counter is unusable.

pub mod collector;
pub mod error;
pub mod flags;
pub mod gcd;
pub mod health;
pub mod init;
pub mod noise;
pub mod platform;
pub mod sha3;
pub mod status;
pub mod timer;

pub use collector::{
    set_fips_failure_callback, EntropyCollector, FipsFailureCallback, NoiseSource, BLOCK_SIZE,
    MAX_SAFE_OSR, MIN_OSR,
};
pub use error::Error;
pub use flags::Flags;
pub use health::HealthFailure;
pub use init::{entropy_init, entropy_init_ex};
pub use status::Status;
pub use timer::{
    switch_timer_impl, BuiltinCounterThread, CounterCell, CounterGuard, CounterThread,
};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const MAJVERSION: u32 = 1;
const MINVERSION: u32 = 2;
const PATCHLEVEL: u32 = 0;

/// Machine-comparable version number: `MAJ * 10^6 + MIN * 10^4 + PATCH *
/// 10^2`. The last two digits are reserved.
pub fn version() -> u32 {
    MAJVERSION * 1_000_000 + MINVERSION * 10_000 + PATCHLEVEL * 100
}
