//! Status reporting: plaintext for operators, JSON for tooling.

use std::error::Error;

use jitterseed_core::{EntropyCollector, Flags};

pub fn run(json: bool, osr: Option<u32>) -> Result<(), Box<dyn Error>> {
    let ec = EntropyCollector::new(osr.unwrap_or(0), Flags::empty())?;
    let status = ec.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{status}");
    }
    Ok(())
}
