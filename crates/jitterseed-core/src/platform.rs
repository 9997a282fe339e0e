//! Platform services consumed by the entropy engine.
//!
//! The engine itself only requires four things from the platform: a
//! mostly-monotonic high-resolution counter, the CPU count, the data cache
//! size, and the FIPS mode indicator. Everything here is probed best-effort;
//! the power-up self-test decides whether the counter is actually usable.

use std::sync::atomic::{compiler_fence, Ordering};

// ---------------------------------------------------------------------------
// High-resolution counter
// ---------------------------------------------------------------------------

/// Read the platform's highest-resolution monotonic counter.
///
/// x86_64 reads the TSC, aarch64 the virtual counter. The counter is used
/// without a serializing instruction: reordering jitter of the read itself is
/// part of the measured signal.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn now_ticks() -> u64 {
    // SAFETY: RDTSC is unprivileged and has no memory effects.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn now_ticks() -> u64 {
    let val: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on all mainstream systems.
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nostack, nomem));
    }
    val
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn now_ticks() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    // Offset by one so a read immediately after the epoch is never zero,
    // which the power-up test treats as "no timer".
    (epoch.elapsed().as_nanos() as u64).wrapping_add(1)
}

/// Cooperative yield for the internal-timer spin loop.
#[inline]
pub fn yield_now() {
    std::thread::yield_now();
}

// ---------------------------------------------------------------------------
// CPU topology probes
// ---------------------------------------------------------------------------

/// Number of online CPUs, or a negative value if it cannot be determined.
pub fn ncpu() -> i64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with a valid name has no preconditions.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            return n as i64;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(-1)
}

/// Data cache size in bytes, or 0 when the platform does not expose it.
///
/// With `all_levels` the sizes of L1d, L2 and L3 are summed; otherwise only
/// L1d is reported. The memory-access noise source sizes its working set
/// from this value.
#[cfg(target_os = "linux")]
pub fn cache_size(all_levels: bool) -> u32 {
    // SAFETY: sysconf with a valid name has no preconditions. A cache
    // level the kernel does not report yields 0 or -1.
    let probe = |name: libc::c_int| -> u64 {
        let v = unsafe { libc::sysconf(name) };
        if v > 0 {
            v as u64
        } else {
            0
        }
    };
    let l1d = probe(libc::_SC_LEVEL1_DCACHE_SIZE);
    if !all_levels {
        return l1d.min(u32::MAX as u64) as u32;
    }
    let total = l1d + probe(libc::_SC_LEVEL2_CACHE_SIZE) + probe(libc::_SC_LEVEL3_CACHE_SIZE);
    total.min(u32::MAX as u64) as u32
}

#[cfg(not(target_os = "linux"))]
pub fn cache_size(all_levels: bool) -> u32 {
    let _ = all_levels;
    0
}

/// Whether the OS runs in FIPS mode.
pub fn fips_enabled() -> bool {
    #[cfg(target_os = "linux")]
    {
        if let Ok(v) = std::fs::read_to_string("/proc/sys/crypto/fips_enabled") {
            return v.trim() == "1";
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Sensitive memory
// ---------------------------------------------------------------------------

/// Overwrite a buffer with zeros in a way the optimizer cannot elide.
pub fn memzero_explicit(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        // SAFETY: the pointer comes from a valid &mut reference.
        unsafe { core::ptr::write_volatile(b, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Same as [`memzero_explicit`] for 64-bit lanes (sponge state).
pub fn memzero_explicit_u64(buf: &mut [u64]) {
    for w in buf.iter_mut() {
        // SAFETY: the pointer comes from a valid &mut reference.
        unsafe { core::ptr::write_volatile(w, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Heap buffer that is zero-initialized on allocation and wiped on drop.
///
/// This stands in for a secure allocator: the memory-access working set and
/// every sensitive scratch buffer of the collector live in one of these so a
/// freed collector leaves nothing behind.
pub struct SecureBuffer {
    buf: Box<[u8]>,
}

impl SecureBuffer {
    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![0u8; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        memzero_explicit(&mut self.buf);
    }
}
