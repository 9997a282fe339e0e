//! Configuration flags for collector allocation and initialization.
//!
//! The lower bits are feature switches; bits 20..25 and 25..30 carry the
//! requested and maximum working-set size for the memory-access noise source
//! as log2 exponents offset by 9, so an encoded value of 1 means 1 KiB and
//! 20 means 512 MiB.

use bitflags::bitflags;

bitflags! {
    /// Collector configuration bitfield.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// Disable the memory access noise source.
        const DISABLE_MEMORY_ACCESS = 1 << 2;
        /// Force the internal timer thread even if the hardware timer works.
        const FORCE_INTERNAL_TIMER = 1 << 3;
        /// Never use the internal timer thread.
        const DISABLE_INTERNAL_TIMER = 1 << 4;
        /// Force FIPS mode regardless of the OS setting.
        const FORCE_FIPS = 1 << 5;
        /// AIS 20/31 NTG.1 startup: exercise each noise source independently.
        const NTG1 = 1 << 6;
        /// Size the memory working set from all cache levels, not just L1d.
        const CACHE_ALL = 1 << 7;

        /// Requested memory size exponent (log2 - 9), bits 20..25.
        const MEMSIZE_MASK = 0x1f << 20;
        /// Maximum memory size exponent (log2 - 9), bits 25..30.
        const MAX_MEMSIZE_MASK = 0x1f << 25;
    }
}

/// Offset between the 5-bit encoded value and the log2 exponent.
const MEMSIZE_EXP_OFFSET: u32 = 9;

/// Smallest working-set exponent: 1 KiB.
pub const MIN_MEMSIZE_EXP: u32 = 10;
/// Largest working-set exponent: 512 MiB.
pub const MAX_MEMSIZE_EXP: u32 = 29;
/// Default working set when neither flags nor the cache probe decide: 256 KiB.
pub const DEFAULT_MEMSIZE_EXP: u32 = 18;
/// Default cap on the working set: 32 MiB.
pub const DEFAULT_MAX_MEMSIZE_EXP: u32 = 25;

impl Flags {
    /// Requested memory size exponent, or `None` when the flags carry none.
    pub fn memsize_exp(&self) -> Option<u32> {
        let v = (self.bits() & Flags::MEMSIZE_MASK.bits()) >> 20;
        (v != 0).then_some(v + MEMSIZE_EXP_OFFSET)
    }

    /// Maximum memory size exponent, or `None` when the flags carry none.
    pub fn max_memsize_exp(&self) -> Option<u32> {
        let v = (self.bits() & Flags::MAX_MEMSIZE_MASK.bits()) >> 25;
        (v != 0).then_some(v + MEMSIZE_EXP_OFFSET)
    }

    /// Encode a requested memory size exponent into the flags.
    pub fn with_memsize_exp(self, exp: u32) -> Flags {
        let exp = exp.clamp(MIN_MEMSIZE_EXP, MAX_MEMSIZE_EXP);
        let bits = (self.bits() & !Flags::MEMSIZE_MASK.bits())
            | ((exp - MEMSIZE_EXP_OFFSET) << 20);
        Flags::from_bits_retain(bits)
    }

    /// Encode a maximum memory size exponent into the flags.
    pub fn with_max_memsize_exp(self, exp: u32) -> Flags {
        let exp = exp.clamp(MIN_MEMSIZE_EXP, MAX_MEMSIZE_EXP);
        let bits = (self.bits() & !Flags::MAX_MEMSIZE_MASK.bits())
            | ((exp - MEMSIZE_EXP_OFFSET) << 25);
        Flags::from_bits_retain(bits)
    }

    /// Raise the maximum memory size by one step above `current_exp`, used
    /// by the read-path recovery when reallocating at a higher OSR.
    pub fn bump_max_memsize(self, current_exp: u32) -> Flags {
        let max = self.max_memsize_exp().unwrap_or(DEFAULT_MAX_MEMSIZE_EXP);
        let next = if current_exp >= max {
            max
        } else {
            current_exp + 1
        };
        self.with_max_memsize_exp(next)
    }
}

/// Resolve the working-set size exponent for a collector.
///
/// Priority: the exponent requested in the flags, then eight times the
/// probed cache size, then the compiled default; always clamped to
/// `[MIN_MEMSIZE_EXP, max]` where `max` comes from the flags or the default
/// cap.
pub(crate) fn resolve_memsize_exp(flags: Flags) -> u32 {
    let exp = flags.memsize_exp().unwrap_or_else(|| {
        let cache = crate::platform::cache_size(flags.contains(Flags::CACHE_ALL));
        if cache > 0 {
            // ilog2(cache) + 3 == log2 of eight times the cache size.
            (31 - cache.leading_zeros()) + 3
        } else {
            DEFAULT_MEMSIZE_EXP
        }
    });

    let max = flags
        .max_memsize_exp()
        .unwrap_or(DEFAULT_MAX_MEMSIZE_EXP)
        .min(MAX_MEMSIZE_EXP);
    exp.clamp(MIN_MEMSIZE_EXP, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_flags_carry_no_memsize() {
        assert_eq!(Flags::empty().memsize_exp(), None);
        assert_eq!(Flags::empty().max_memsize_exp(), None);
    }

    #[test]
    fn test_memsize_roundtrip() {
        let f = Flags::NTG1.with_memsize_exp(20);
        assert_eq!(f.memsize_exp(), Some(20));
        assert!(f.contains(Flags::NTG1));

        let f = f.with_max_memsize_exp(25);
        assert_eq!(f.max_memsize_exp(), Some(25));
        assert_eq!(f.memsize_exp(), Some(20));
    }

    #[test]
    fn test_memsize_clamped_to_valid_range() {
        assert_eq!(Flags::empty().with_memsize_exp(5).memsize_exp(), Some(10));
        assert_eq!(Flags::empty().with_memsize_exp(40).memsize_exp(), Some(29));
    }

    #[test]
    fn test_resolve_respects_requested_size() {
        let f = Flags::empty().with_memsize_exp(12);
        assert_eq!(resolve_memsize_exp(f), 12);
    }

    #[test]
    fn test_resolve_caps_at_maximum() {
        let f = Flags::empty()
            .with_memsize_exp(24)
            .with_max_memsize_exp(16);
        assert_eq!(resolve_memsize_exp(f), 16);
    }

    #[test]
    fn test_resolve_within_bounds_without_request() {
        let exp = resolve_memsize_exp(Flags::empty());
        assert!((MIN_MEMSIZE_EXP..=DEFAULT_MAX_MEMSIZE_EXP).contains(&exp));
    }

    #[test]
    fn test_bump_max_memsize_steps_up() {
        let f = Flags::empty().with_max_memsize_exp(20);
        assert_eq!(f.bump_max_memsize(18).max_memsize_exp(), Some(19));
        assert_eq!(f.bump_max_memsize(20).max_memsize_exp(), Some(20));
    }
}
