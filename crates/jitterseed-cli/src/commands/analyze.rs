//! Quick quality assessment of a recorded data file.
//!
//! Not a substitute for the SP800-90B estimators. This is the fast sanity
//! check run before shipping a recording off to the real tooling: Shannon
//! entropy, zlib compression ratio, unique symbol count and a letter grade.

use std::error::Error;
use std::io::Write;

pub fn run(path: &str) -> Result<(), Box<dyn Error>> {
    let data = load_samples(path)?;
    if data.len() < 16 {
        return Err(format!("{path}: too few samples ({})", data.len()).into());
    }

    let report = quality(&data);
    println!("File:              {path}");
    println!("Samples:           {}", report.samples);
    println!("Unique values:     {}/256", report.unique_values);
    println!("Shannon entropy:   {:.3} bits/byte", report.shannon_entropy);
    println!("Compression ratio: {:.3}", report.compression_ratio);
    println!("Quality score:     {:.1}/100", report.quality_score);
    println!("Grade:             {}", report.grade);
    Ok(())
}

/// Load a recording: binary u64 records for `*-u64.bin` files, decimal
/// lines otherwise. Each delta is reduced to its least significant byte,
/// which is where the per-sample jitter lives.
fn load_samples(path: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let raw = std::fs::read(path)?;

    if path.ends_with("-u64.bin") {
        return Ok(raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()) as u8)
            .collect());
    }

    let text = String::from_utf8(raw)?;
    let mut samples = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: u64 = line.parse()?;
        samples.push(value as u8);
    }
    Ok(samples)
}

struct QualityReport {
    samples: usize,
    unique_values: usize,
    shannon_entropy: f64,
    compression_ratio: f64,
    quality_score: f64,
    grade: char,
}

/// Shannon entropy in bits per byte.
fn shannon(data: &[u8]) -> f64 {
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let n = data.len() as f64;
    let mut h = 0.0;
    for &c in &counts {
        if c > 0 {
            let p = c as f64 / n;
            h -= p * p.log2();
        }
    }
    h
}

fn quality(data: &[u8]) -> QualityReport {
    let shannon_entropy = shannon(data);

    // Compression ratio: incompressible data stays near 1.0.
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).unwrap_or_default();
    let compressed = encoder.finish().unwrap_or_default();
    let compression_ratio = compressed.len() as f64 / data.len() as f64;

    let mut seen = [false; 256];
    for &b in data {
        seen[b as usize] = true;
    }
    let unique_values = seen.iter().filter(|&&s| s).count();

    let eff = shannon_entropy / 8.0;
    let quality_score = eff * 60.0
        + compression_ratio.min(1.0) * 20.0
        + (unique_values as f64 / 256.0).min(1.0) * 20.0;
    let grade = if quality_score >= 80.0 {
        'A'
    } else if quality_score >= 60.0 {
        'B'
    } else if quality_score >= 40.0 {
        'C'
    } else if quality_score >= 20.0 {
        'D'
    } else {
        'F'
    };

    QualityReport {
        samples: data.len(),
        unique_values,
        shannon_entropy,
        compression_ratio,
        quality_score,
        grade,
    }
}
