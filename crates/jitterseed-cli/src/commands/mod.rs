pub mod analyze;
pub mod record;
pub mod seed;
pub mod status;

use jitterseed_core::Flags;

/// Shared flag assembly for commands that allocate a collector.
pub(crate) fn build_flags(
    ntg1: bool,
    force_fips: bool,
    disable_memory_access: bool,
    disable_internal_timer: bool,
    force_internal_timer: bool,
    all_caches: bool,
    max_mem: Option<u32>,
) -> Flags {
    let mut flags = Flags::empty();
    if ntg1 {
        flags |= Flags::NTG1;
    }
    if force_fips {
        flags |= Flags::FORCE_FIPS;
    }
    if disable_memory_access {
        flags |= Flags::DISABLE_MEMORY_ACCESS;
    }
    if disable_internal_timer {
        flags |= Flags::DISABLE_INTERNAL_TIMER;
    }
    if force_internal_timer {
        flags |= Flags::FORCE_INTERNAL_TIMER;
    }
    if all_caches {
        flags |= Flags::CACHE_ALL;
    }
    if let Some(step) = max_mem {
        // The step value counts from 1 KiB upward, matching the exponent
        // encoding offset of 9.
        flags = flags.with_max_memsize_exp(step + 9);
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_flags_combines_switches() {
        let f = build_flags(true, true, false, true, false, false, None);
        assert!(f.contains(Flags::NTG1));
        assert!(f.contains(Flags::FORCE_FIPS));
        assert!(f.contains(Flags::DISABLE_INTERNAL_TIMER));
        assert!(!f.contains(Flags::DISABLE_MEMORY_ACCESS));
    }

    #[test]
    fn test_build_flags_max_mem_encoding() {
        // Step 7 = 64 KiB = 2^16.
        let f = build_flags(false, false, false, false, false, false, Some(7));
        assert_eq!(f.max_memsize_exp(), Some(16));
    }
}
