//! Command implementations

pub mod config;
pub mod erase;
pub mod list;
pub mod read;
pub mod verify;
pub mod write;

use avrprog_core::part::{Part, PartDatabase};
use avrprog_core::programmer::{verify_signature, Programmer};

use crate::programmers;

/// An open connection to one part through one programmer
pub struct Session {
    pub part: Part,
    pub pgm: Box<dyn Programmer>,
}

/// Resolve the part, open the programmer and check the device signature
pub fn open(
    db: &PartDatabase,
    part_key: &str,
    pgm_spec: &str,
    force: bool,
) -> Result<Session, Box<dyn std::error::Error>> {
    let part = db
        .find(part_key)
        .ok_or_else(|| format!("unknown part \"{part_key}\" (see list-parts)"))?
        .clone();
    let pgm = programmers::open_programmer(pgm_spec, &part)?;

    let mut session = Session { part, pgm };
    if force {
        log::warn!("--force given, skipping signature check");
    } else {
        verify_signature(&mut session.pgm, &session.part)?;
        log::info!("device signature matches {}", session.part.name);
    }
    Ok(session)
}
