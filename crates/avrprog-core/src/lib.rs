//! avrprog-core - Core library for AVR in-system programming
//!
//! This crate provides the device-independent half of a microcontroller
//! programmer: the paged memory cache that keeps device round-trips to at
//! most one per page and reconciles pending writes against NOR-like erase
//! semantics, the declarative opcode codec that assembles serial programming
//! commands from the part database's bit tables, and symbolic fuse/lock
//! bitfield access.
//!
//! Programmer drivers plug in through the [`programmer::Programmer`] trait;
//! everything above it is hardware-agnostic.
//!
//! # Example
//!
//! ```ignore
//! use avrprog_core::cache::{CacheSession, NoProgress};
//! use avrprog_core::part::PartDatabase;
//!
//! fn blank_check<P: avrprog_core::programmer::Programmer>(pgm: &mut P) {
//!     let part = PartDatabase::builtin().find("m328p").unwrap();
//!     let flash = part.flash().unwrap();
//!     let mut session = CacheSession::new();
//!     for addr in 0..flash.size {
//!         let byte = session.read_byte(pgm, part, flash, addr).unwrap();
//!         assert_eq!(byte, 0xff);
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod error;
pub mod opcode;
pub mod part;
pub mod programmer;

pub use error::{Error, Result};
