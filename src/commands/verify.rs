//! Verify command implementation

use std::fs;
use std::path::Path;

use avrprog_core::cache::CacheSession;
use avrprog_core::part::PartDatabase;

use crate::cli::DeviceArgs;

/// Run the verify command
pub fn run(
    db: &PartDatabase,
    device: &DeviceArgs,
    memory: &str,
    input: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut s = super::open(db, &device.part, &device.programmer, device.force)?;
    let mem = s
        .part
        .memory(memory)
        .ok_or_else(|| format!("part {} has no \"{memory}\" memory", s.part.name))?;

    let expected = fs::read(input)?;
    if expected.len() > mem.size as usize {
        return Err(format!(
            "file size ({} bytes) exceeds {} size ({} bytes)",
            expected.len(),
            mem.name,
            mem.size
        )
        .into());
    }

    let pb = super::read::byte_progress_bar(expected.len() as u64, "Verifying")?;
    let mut cache = CacheSession::new();
    for (i, &want) in expected.iter().enumerate() {
        let got = cache.read_byte(&mut s.pgm, &s.part, mem, i as u32)?;
        if got != want {
            pb.abandon_with_message("Verification failed!");
            return Err(format!(
                "mismatch at offset 0x{:08x}: expected 0x{:02x}, got 0x{:02x}",
                i, want, got
            )
            .into());
        }
        if i % 256 == 0 {
            pb.set_position(i as u64);
        }
    }
    pb.finish_with_message("Verification passed");

    println!("{} bytes of {} verified", expected.len(), mem.name);
    Ok(())
}
