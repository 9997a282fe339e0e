//! Raw-delta recording for SP800-90B entropy assessment.
//!
//! Each repeat allocates a fresh collector and records `rounds` raw timing
//! deltas, producing the restart data matrix expected by the SP800-90B
//! tooling. The stuck verdict is ignored on purpose: the assessment wants
//! the unfiltered distribution.

use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};

use jitterseed_core::{entropy_init_ex, EntropyCollector, Flags, NoiseSource};

pub struct RecordConfig {
    pub rounds: usize,
    pub repeats: usize,
    pub output: String,
    pub memaccess: bool,
    pub hashloop: bool,
    pub loopcnt: u64,
    pub osr: Option<u32>,
    pub max_mem: Option<u32>,
    pub ntg1: bool,
    pub force_fips: bool,
    pub disable_memory_access: bool,
    pub disable_internal_timer: bool,
    pub force_internal_timer: bool,
    pub all_caches: bool,
    pub raw_ticks: bool,
    pub binary: bool,
}

pub fn run(cfg: RecordConfig) -> Result<(), Box<dyn Error>> {
    if cfg.memaccess && cfg.hashloop {
        return Err("choose at most one of --memaccess and --hashloop".into());
    }
    let source = if cfg.memaccess {
        NoiseSource::MemAccess
    } else if cfg.hashloop {
        NoiseSource::HashLoop
    } else {
        NoiseSource::Combined
    };

    let flags = super::build_flags(
        cfg.ntg1,
        cfg.force_fips,
        cfg.disable_memory_access,
        cfg.disable_internal_timer,
        cfg.force_internal_timer,
        cfg.all_caches,
        cfg.max_mem,
    );
    // The full SP800-90B health test handling must be live while recording.
    let flags = flags | Flags::FORCE_FIPS;
    let osr = cfg.osr.unwrap_or(0);

    entropy_init_ex(osr, flags)?;
    log::info!(
        "recording {} rounds x {} repeats from {:?}",
        cfg.rounds,
        cfg.repeats,
        source
    );

    for repeat in 1..=cfg.repeats {
        let pathname = if cfg.binary {
            format!("{}-{:04}-u64.bin", cfg.output, repeat)
        } else {
            format!("{}-{:04}.data", cfg.output, repeat)
        };
        println!("Processing {pathname}");

        let mut ec = EntropyCollector::new(osr, flags)?;
        if cfg.raw_ticks {
            ec.set_raw_tick_reporting(true);
        }
        if repeat == 1 {
            println!("Memory size: {} bytes", ec.memory_size());
        }

        let deltas = ec.record_raw_deltas(source, cfg.rounds, cfg.loopcnt)?;

        let file = File::create(&pathname)?;
        let mut out = BufWriter::new(file);
        if cfg.binary {
            for delta in &deltas {
                out.write_all(&delta.to_le_bytes())?;
            }
        } else {
            for delta in &deltas {
                writeln!(out, "{delta}")?;
            }
        }
        out.flush()?;

        let failure = ec.health_failure();
        if !failure.is_empty() {
            println!("Health test failure(s) while recording: {failure:?}");
        }
    }

    Ok(())
}
