//! Runtime status reporting for a collector.
//!
//! [`Status`] is a plain snapshot: serialize it for machine consumers or
//! print it via `Display` for humans. It intentionally carries no
//! sensitive material, only configuration and health-test verdicts.

use std::fmt;

use serde::Serialize;

use crate::collector::EntropyCollector;
use crate::flags::Flags;
use crate::health::HealthFailure;
use crate::noise::{MEMORY_ACCESSLOOPS, MEM_ACC_LOOP_DEFAULT, NOISE_LOOP_INIT_MULTIPLIER};
use crate::platform;

/// Pass/fail verdict of one health test.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TestStatus {
    /// Intermittent failure currently raised.
    pub intermittent: bool,
    /// Permanent failure latched.
    pub permanent: bool,
}

impl TestStatus {
    fn from_bits(failure: HealthFailure, bit: HealthFailure, permanent: HealthFailure) -> Self {
        Self {
            intermittent: failure.intersects(bit),
            permanent: failure.intersects(permanent),
        }
    }
}

/// Flag switches as booleans for reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusFlags {
    pub disable_memory_access: bool,
    pub force_internal_timer: bool,
    pub disable_internal_timer: bool,
    pub force_fips: bool,
    pub ntg1: bool,
    pub cache_all: bool,
}

/// Snapshot of a collector's configuration and health state.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: String,
    pub version_code: u32,
    pub rct: TestStatus,
    pub apt: TestStatus,
    pub lag: TestStatus,
    pub dist: TestStatus,
    pub osr: u32,
    pub memory_size: usize,
    pub cache_size_l1: u32,
    pub cache_size_all: u32,
    pub hash_loop_count: u64,
    pub hash_loop_count_init: u64,
    pub memory_access_loops: u64,
    pub memory_access_loops_init: u64,
    pub internal_timer: bool,
    pub fips_mode: bool,
    pub ntg1: bool,
    pub cpu_count: i64,
    pub flags: StatusFlags,
}

impl EntropyCollector {
    /// Capture the current status of this collector.
    pub fn status(&self) -> Status {
        let failure = self.health_failure_raw();
        let flags = self.flags();

        Status {
            version: crate::VERSION.to_string(),
            version_code: crate::version(),
            rct: TestStatus::from_bits(failure, HealthFailure::RCT, HealthFailure::RCT_PERMANENT),
            apt: TestStatus::from_bits(failure, HealthFailure::APT, HealthFailure::APT_PERMANENT),
            lag: TestStatus::from_bits(failure, HealthFailure::LAG, HealthFailure::LAG_PERMANENT),
            dist: TestStatus::from_bits(
                failure,
                HealthFailure::DIST,
                HealthFailure::DIST_PERMANENT,
            ),
            osr: self.osr(),
            memory_size: self.memory_size(),
            cache_size_l1: platform::cache_size(false),
            cache_size_all: platform::cache_size(true),
            hash_loop_count: self.hash_loop_count(),
            hash_loop_count_init: self.hash_loop_count() * NOISE_LOOP_INIT_MULTIPLIER,
            memory_access_loops: u64::from(MEMORY_ACCESSLOOPS) + MEM_ACC_LOOP_DEFAULT,
            memory_access_loops_init: u64::from(MEMORY_ACCESSLOOPS)
                + MEM_ACC_LOOP_DEFAULT * NOISE_LOOP_INIT_MULTIPLIER,
            internal_timer: self.internal_timer(),
            fips_mode: self.fips_enabled(),
            ntg1: flags.contains(Flags::NTG1),
            cpu_count: platform::ncpu(),
            flags: StatusFlags {
                disable_memory_access: flags.contains(Flags::DISABLE_MEMORY_ACCESS),
                force_internal_timer: flags.contains(Flags::FORCE_INTERNAL_TIMER),
                disable_internal_timer: flags.contains(Flags::DISABLE_INTERNAL_TIMER),
                force_fips: flags.contains(Flags::FORCE_FIPS),
                ntg1: flags.contains(Flags::NTG1),
                cache_all: flags.contains(Flags::CACHE_ALL),
            },
        }
    }
}

fn verdict(fail: bool) -> &'static str {
    if fail {
        "fail"
    } else {
        "pass"
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Jitter RNG version: {}", self.version)?;
        writeln!(f)?;
        writeln!(f, "Health Status:")?;
        for (name, test) in [
            ("RCT", &self.rct),
            ("APT", &self.apt),
            ("LAG", &self.lag),
            ("DIST", &self.dist),
        ] {
            writeln!(f, " {name}:")?;
            writeln!(f, "  intermittent: {}", verdict(test.intermittent))?;
            writeln!(f, "  permanent: {}", verdict(test.permanent))?;
        }
        writeln!(f, "Configuration:")?;
        writeln!(f, " OSR: {}", self.osr)?;
        writeln!(f, " Memory Block Size: {} bytes", self.memory_size)?;
        writeln!(f, " Detected Cache Sizes:")?;
        writeln!(f, "  L1 {} bytes", self.cache_size_l1)?;
        writeln!(f, "  all caches {} bytes", self.cache_size_all)?;
        writeln!(f, " Hash loop count:")?;
        writeln!(f, "  runtime: {}", self.hash_loop_count)?;
        writeln!(f, "  initialization: {}", self.hash_loop_count_init)?;
        writeln!(f, " Memory Access loop count:")?;
        writeln!(f, "  runtime: {}", self.memory_access_loops)?;
        writeln!(f, "  initialization: {}", self.memory_access_loops_init)?;
        writeln!(f, " Internal Timer: {}", self.internal_timer as u8)?;
        writeln!(f, " FIPS mode: {}", self.fips_mode as u8)?;
        writeln!(f, " AIS 20/31 NTG.1 mode: {}", self.ntg1 as u8)?;
        writeln!(f, " CPU Cores: {}", self.cpu_count)?;
        writeln!(f, " Flags:")?;
        writeln!(
            f,
            "  DISABLE_MEMORY_ACCESS {}",
            self.flags.disable_memory_access as u8
        )?;
        writeln!(
            f,
            "  FORCE_INTERNAL_TIMER {}",
            self.flags.force_internal_timer as u8
        )?;
        writeln!(
            f,
            "  DISABLE_INTERNAL_TIMER {}",
            self.flags.disable_internal_timer as u8
        )?;
        writeln!(f, "  FORCE_FIPS {}", self.flags.force_fips as u8)?;
        writeln!(f, "  NTG1 {}", self.flags.ntg1 as u8)?;
        write!(f, "  CACHE_ALL {}", self.flags.cache_all as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn any_collector() -> Result<EntropyCollector, Error> {
        EntropyCollector::probe(3, Flags::DISABLE_INTERNAL_TIMER)
    }

    #[test]
    fn test_status_snapshot_fields() {
        let ec = any_collector().unwrap();
        let status = ec.status();
        assert_eq!(status.osr, 3);
        assert!(status.memory_size.is_power_of_two());
        assert!(status.fips_mode, "probe collectors force FIPS");
        assert!(!status.rct.permanent);
        assert_eq!(status.version_code, crate::version());
    }

    #[test]
    fn test_status_display_contains_sections() {
        let ec = any_collector().unwrap();
        let text = ec.status().to_string();
        assert!(text.contains("Health Status:"));
        assert!(text.contains("RCT:"));
        assert!(text.contains("Configuration:"));
        assert!(text.contains("OSR: 3"));
        assert!(text.contains("FIPS mode: 1"));
    }

    #[test]
    fn test_status_serializes_to_json() {
        let ec = any_collector().unwrap();
        let status = ec.status();
        // serde_json lives in the CLI; here it is enough that the derive
        // compiles and the struct is cloneable for snapshotting.
        let copy = status.clone();
        assert_eq!(copy.osr, status.osr);
    }
}
