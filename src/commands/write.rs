//! Write command implementation

use std::fs;
use std::path::Path;

use avrprog_core::cache::{CacheSession, FlushProgress, FlushStats};
use avrprog_core::part::PartDatabase;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::cli::DeviceArgs;

/// Progress reporter for the flush phases using indicatif bars
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} pages {}",
                    phase
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &'static str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message);
        }
    }

    fn set_position(&mut self, pos: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(pos as u64);
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushProgress for IndicatifProgress {
    fn reading(&mut self, total: usize) {
        self.create_bar(total as u64, "Reading");
    }

    fn read_progress(&mut self, done: usize) {
        self.set_position(done);
    }

    fn erasing(&mut self, total: usize) {
        self.finish("Read complete");
        self.create_bar(total as u64, "Erasing");
    }

    fn erase_progress(&mut self, done: usize) {
        self.set_position(done);
    }

    fn writing(&mut self, total: usize) {
        self.finish("Erase complete");
        self.create_bar(total as u64, "Writing");
    }

    fn write_progress(&mut self, done: usize) {
        self.set_position(done);
    }

    fn complete(&mut self, stats: &FlushStats) {
        self.finish("Write complete");

        if !stats.modified() {
            println!("Device already contains the desired data - no changes needed");
        } else if stats.chip_erased {
            println!(
                "Committed with a chip erase: {} pages re-read, {} pages written",
                stats.pages_read, stats.pages_written
            );
        } else {
            println!(
                "Committed: {} pages erased, {} pages written",
                stats.pages_erased, stats.pages_written
            );
        }
    }
}

/// Run the write command
pub fn run(
    db: &PartDatabase,
    device: &DeviceArgs,
    memory: &str,
    input: &Path,
    verify: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut s = super::open(db, &device.part, &device.programmer, device.force)?;
    let mem = s
        .part
        .memory(memory)
        .ok_or_else(|| format!("part {} has no \"{memory}\" memory", s.part.name))?;

    let data = fs::read(input)?;
    println!("Read {} bytes from {:?}", data.len(), input);

    if data.len() > mem.size as usize {
        return Err(format!(
            "file size ({} bytes) exceeds {} size ({} bytes)",
            data.len(),
            mem.name,
            mem.size
        )
        .into());
    }

    // stage into the cache, then commit everything in one flush
    let pb = super::read::byte_progress_bar(data.len() as u64, "Staging")?;
    let mut cache = CacheSession::new();
    for (i, &byte) in data.iter().enumerate() {
        cache.write_byte(&mut s.pgm, &s.part, mem, i as u32, byte)?;
        if i % 256 == 0 {
            pb.set_position(i as u64);
        }
    }
    pb.finish_with_message("Staged");

    let mut progress = IndicatifProgress::new();
    cache.flush(&mut s.pgm, &s.part, &mut progress)?;

    if verify {
        // re-read through a fresh cache so the comparison hits the device
        let pb = super::read::byte_progress_bar(data.len() as u64, "Verifying")?;
        let mut fresh = CacheSession::new();
        for (i, &expected) in data.iter().enumerate() {
            let got = fresh.read_byte(&mut s.pgm, &s.part, mem, i as u32)?;
            if got != expected {
                pb.abandon_with_message("Verification failed!");
                return Err(format!(
                    "verification failed at offset 0x{:08x}: expected 0x{:02x}, got 0x{:02x}",
                    i, expected, got
                )
                .into());
            }
            if i % 256 == 0 {
                pb.set_position(i as u64);
            }
        }
        pb.finish_with_message("Verification passed");
    }

    println!("Write complete");
    Ok(())
}
