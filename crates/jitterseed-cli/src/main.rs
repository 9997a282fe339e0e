//! CLI for jitterseed — record raw jitter, inspect status, emit seeds.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jitterseed")]
#[command(about = "jitterseed — CPU execution-time jitter TRNG")]
#[command(version = jitterseed_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record raw per-sample timing deltas for SP800-90B entropy assessment.
    /// Writes one file per repeat (the restart matrix rows).
    Record {
        /// Number of raw values generated per repeat
        rounds: usize,

        /// Number of repeats, each with a freshly allocated collector
        repeats: usize,

        /// Output path prefix; files are named <prefix>-NNNN.data
        output: String,

        /// Exercise only the memory access noise source
        #[arg(long)]
        memaccess: bool,

        /// Exercise only the hash loop noise source
        #[arg(long)]
        hashloop: bool,

        /// Loop count override applied to the selected noise source(s)
        #[arg(long, default_value = "0")]
        loopcnt: u64,

        /// Oversampling rate
        #[arg(long)]
        osr: Option<u32>,

        /// Cap the memory working set at 2^(9+N) bytes (1 = 1 KiB .. 20 = 512 MiB)
        #[arg(long)]
        max_mem: Option<u32>,

        /// Enable AIS 20/31 NTG.1 startup behavior
        #[arg(long)]
        ntg1: bool,

        /// Force FIPS mode
        #[arg(long)]
        force_fips: bool,

        /// Disable the memory access noise source
        #[arg(long)]
        disable_memory_access: bool,

        /// Never use the internal timer thread
        #[arg(long)]
        disable_internal_timer: bool,

        /// Force the internal timer thread
        #[arg(long)]
        force_internal_timer: bool,

        /// Size the working set from all cache levels
        #[arg(long)]
        all_caches: bool,

        /// Report raw counter ticks without the common divisor removed
        #[arg(long)]
        raw_ticks: bool,

        /// Write little-endian u64 binary records instead of decimal lines
        #[arg(long)]
        binary: bool,
    },

    /// Print the collector status report
    Status {
        /// Emit JSON instead of plaintext
        #[arg(long)]
        json: bool,

        /// Oversampling rate for the inspected collector
        #[arg(long)]
        osr: Option<u32>,
    },

    /// Generate seed bytes and write them to stdout
    Seed {
        /// Number of bytes to generate
        #[arg(long, default_value = "32")]
        bytes: usize,

        /// Output format
        #[arg(long, default_value = "hex", value_parser = ["hex", "raw"])]
        format: String,

        /// Oversampling rate
        #[arg(long)]
        osr: Option<u32>,

        /// Force FIPS mode (health failures abort instead of being ignored)
        #[arg(long)]
        force_fips: bool,
    },

    /// Quick quality check of a recorded data file: Shannon entropy,
    /// compression ratio and a letter grade
    Analyze {
        /// Path to a file written by `record` (decimal or binary)
        file: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Record {
            rounds,
            repeats,
            output,
            memaccess,
            hashloop,
            loopcnt,
            osr,
            max_mem,
            ntg1,
            force_fips,
            disable_memory_access,
            disable_internal_timer,
            force_internal_timer,
            all_caches,
            raw_ticks,
            binary,
        } => commands::record::run(commands::record::RecordConfig {
            rounds,
            repeats,
            output,
            memaccess,
            hashloop,
            loopcnt,
            osr,
            max_mem,
            ntg1,
            force_fips,
            disable_memory_access,
            disable_internal_timer,
            force_internal_timer,
            all_caches,
            raw_ticks,
            binary,
        }),
        Commands::Status { json, osr } => commands::status::run(json, osr),
        Commands::Seed {
            bytes,
            format,
            osr,
            force_fips,
        } => commands::seed::run(bytes, &format, osr, force_fips),
        Commands::Analyze { file } => commands::analyze::run(&file),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
