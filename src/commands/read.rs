//! Read command implementation

use std::fs;
use std::path::Path;

use avrprog_core::cache::CacheSession;
use avrprog_core::part::PartDatabase;
use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::DeviceArgs;

/// Create the standard byte-count progress bar
pub(crate) fn byte_progress_bar(
    total: u64,
    phase: &str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Run the read command
pub fn run(
    db: &PartDatabase,
    device: &DeviceArgs,
    memory: &str,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut s = super::open(db, &device.part, &device.programmer, device.force)?;
    let mem = s
        .part
        .memory(memory)
        .ok_or_else(|| format!("part {} has no \"{memory}\" memory", s.part.name))?;

    println!("Reading {} ({} bytes) from {}", mem.name, mem.size, s.part.name);

    let pb = byte_progress_bar(u64::from(mem.size), "Reading")?;
    let mut cache = CacheSession::new();
    let mut data = Vec::with_capacity(mem.size as usize);
    for addr in 0..mem.size {
        data.push(cache.read_byte(&mut s.pgm, &s.part, mem, addr)?);
        if addr % 256 == 0 {
            pb.set_position(u64::from(addr));
        }
    }
    pb.finish_with_message("Read complete");

    fs::write(output, &data)?;
    println!("Wrote {} bytes to {:?}", data.len(), output);
    Ok(())
}
