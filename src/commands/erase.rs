//! Erase command implementation

use avrprog_core::cache::CacheSession;
use avrprog_core::part::PartDatabase;

use crate::cli::DeviceArgs;

/// Run the erase command
pub fn run(db: &PartDatabase, device: &DeviceArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut s = super::open(db, &device.part, &device.programmer, device.force)?;

    println!("Erasing {}", s.part.name);
    let mut cache = CacheSession::new();
    cache.chip_erase(&mut s.pgm, &s.part)?;
    println!("Chip erased");
    Ok(())
}
