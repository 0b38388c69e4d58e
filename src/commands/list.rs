//! Listing commands

use avrprog_core::part::PartDatabase;

use crate::programmers;

/// Print the supported parts
pub fn list_parts(db: &PartDatabase, filter: Option<&str>) {
    println!("Supported parts:");
    for part in db.iter() {
        if let Some(f) = filter {
            if !part.name.to_lowercase().contains(&f.to_lowercase()) {
                continue;
            }
        }
        let flash = part.flash().map_or(0, |m| m.size);
        let eeprom = part.eeprom().map_or(0, |m| m.size);
        println!(
            "  {:8} {:12} flash {:4} KiB, eeprom {:4} B",
            part.id,
            part.name,
            flash / 1024,
            eeprom
        );
    }
}

/// Print the compiled-in programmers
pub fn list_programmers() {
    println!("Supported programmers:");
    for info in programmers::PROGRAMMERS {
        println!("  {:8} {}", info.name, info.description);
    }
}
