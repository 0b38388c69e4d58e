//! Error types for avrprog-core

use thiserror::Error;

use crate::opcode::OpKind;

/// Result type alias using the core Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the core library
///
/// Programmer drivers construct `Io` for transport-level failures; the core
/// propagates those unchanged. Everything else is raised by the core itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A programmer transport primitive failed
    #[error("programmer I/O error: {0}")]
    Io(String),

    /// The programmer does not implement the requested primitive
    #[error("operation not supported by this programmer")]
    NotSupported,

    /// Address beyond the declared size of a memory
    #[error("address 0x{addr:04x} is out of range for {memory} ({size} bytes)")]
    AddressOutOfRange {
        /// Memory name
        memory: String,
        /// Offending address
        addr: u32,
        /// Declared memory size
        size: u32,
    },

    /// A memory's geometry disagrees with the cache that backs it
    ///
    /// This indicates a defective part definition, not a device problem.
    #[error("cache geometry mismatch for {memory}: {detail}")]
    IncompatibleGeometry {
        /// Memory name
        memory: String,
        /// What disagreed
        detail: String,
    },

    /// A page write did not read back as intended
    #[error(
        "verify failed: {memory} offset 0x{addr:04x} wrote 0x{expected:02x}, read back 0x{found:02x}"
    )]
    VerificationMismatch {
        /// Memory name
        memory: String,
        /// First mismatching address
        addr: u32,
        /// Byte that was written
        expected: u8,
        /// Byte that came back
        found: u8,
    },

    /// A page erase did not leave the page blank
    #[error("page erase left {memory} page at 0x{addr:04x} not blank")]
    EraseVerifyFailed {
        /// Memory name
        memory: String,
        /// Page base address
        addr: u32,
    },

    /// No memory with the given name exists in the part definition
    #[error("part has no \"{0}\" memory")]
    NoSuchMemory(String),

    /// The part definition carries no opcode for the requested operation
    #[error("no {op:?} opcode defined for {memory}")]
    MissingOpcode {
        /// Memory name
        memory: String,
        /// Operation that has no opcode
        op: OpKind,
    },

    /// An opcode bit string in the part database could not be parsed
    #[error("invalid opcode bit specification: {0}")]
    InvalidOpcodeSpec(String),

    /// No configuration item matched the given name
    #[error("unknown configuration item \"{0}\"")]
    UnknownConfig(String),

    /// More than one configuration item matched the given name
    #[error("configuration name \"{name}\" is ambiguous ({} candidates)", .candidates.len())]
    AmbiguousConfig {
        /// The pattern that matched more than once
        name: String,
        /// Full names of all matching items
        candidates: Vec<String>,
    },

    /// A symbolic configuration value did not resolve
    #[error("unknown value \"{value}\" for configuration item {item}")]
    UnknownConfigValue {
        /// Configuration item name
        item: String,
        /// The value text that failed to resolve
        value: String,
    },

    /// Device signature does not match the selected part
    #[error("device signature {found:02x?} does not match {part} (expected {expected:02x?})")]
    SignatureMismatch {
        /// Part name from the database
        part: String,
        /// Signature the database expects
        expected: [u8; 3],
        /// Signature read from the device
        found: [u8; 3],
    },
}
