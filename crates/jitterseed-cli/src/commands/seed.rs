//! Seed output: generate entropy and write it to stdout.

use std::error::Error;
use std::io::Write;

use jitterseed_core::{EntropyCollector, Flags};

pub fn run(
    bytes: usize,
    format: &str,
    osr: Option<u32>,
    force_fips: bool,
) -> Result<(), Box<dyn Error>> {
    let flags = if force_fips {
        Flags::FORCE_FIPS
    } else {
        Flags::empty()
    };

    let mut ec = EntropyCollector::new(osr.unwrap_or(0), flags)?;
    let mut buf = vec![0u8; bytes];
    ec.read_safe(&mut buf)?;

    match format {
        "raw" => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(&buf)?;
            handle.flush()?;
        }
        _ => {
            let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
            println!("{hex}");
        }
    }
    Ok(())
}
