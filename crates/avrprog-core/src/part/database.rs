//! Part database for runtime loading and lookup
//!
//! Part definitions live in RON files, one vendor per file. A built-in
//! database covering the common parts is embedded in the library; additional
//! or overriding definitions can be loaded from files or directories.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::Deserialize;
use thiserror::Error;

use super::{ConfigItem, ConfigValue, Memory, MemoryKind, Part};
use crate::opcode::{OpKind, OpcodeSpec};

/// Error type for part database operations
#[derive(Debug, Error)]
pub enum PartDbError {
    /// I/O error reading files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// RON parsing error
    #[error("parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// Definition failed validation
    #[error("invalid part definition: {0}")]
    Validation(String),
}

// ============================================================================
// RON deserialization types (intermediate format)
// ============================================================================

/// Size specification with human-readable units (for RON parsing)
#[derive(Debug, Clone, Copy, Deserialize)]
pub enum Size {
    /// Size in bytes
    B(u32),
    /// Size in kibibytes (1024 bytes)
    KiB(u32),
    /// Size in mebibytes (1024 * 1024 bytes)
    MiB(u32),
}

impl Size {
    /// Convert to bytes
    pub fn to_bytes(self) -> u32 {
        match self {
            Size::B(n) => n,
            Size::KiB(n) => n * 1024,
            Size::MiB(n) => n * 1024 * 1024,
        }
    }
}

/// Single memory definition in RON format
#[derive(Debug, Clone, Deserialize)]
struct MemoryDef {
    name: String,
    kind: MemoryKind,
    size: Size,
    #[serde(default = "default_page_size")]
    page_size: Size,
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    ops: HashMap<OpKind, String>,
}

fn default_page_size() -> Size {
    Size::B(1)
}

/// Configuration bitfield definition in RON format
#[derive(Debug, Clone, Deserialize)]
struct ConfigItemDef {
    name: String,
    memory: String,
    mask: u32,
    #[serde(default)]
    shift: u8,
    #[serde(default)]
    values: Vec<(String, u32)>,
}

/// Single part definition in RON format
#[derive(Debug, Clone, Deserialize)]
struct PartDef {
    name: String,
    id: String,
    signature: (u8, u8, u8),
    #[serde(default)]
    boot_start: Option<u32>,
    #[serde(default)]
    chip_erase: Option<String>,
    #[serde(default)]
    pgm_enable: Option<String>,
    memories: Vec<MemoryDef>,
    #[serde(default)]
    config: Vec<ConfigItemDef>,
}

/// Vendor definition containing multiple parts
#[derive(Debug, Clone, Deserialize)]
struct VendorDef {
    #[allow(dead_code)]
    vendor: String,
    parts: Vec<PartDef>,
}

// ============================================================================
// Part database
// ============================================================================

/// Runtime part database
#[derive(Debug, Clone, Default)]
pub struct PartDatabase {
    parts: Vec<Part>,
}

static BUILTIN: Lazy<PartDatabase> = Lazy::new(|| {
    let mut db = PartDatabase::new();
    db.load_ron(include_str!("../../parts/atmel.ron"))
        .expect("built-in part database is valid");
    db
});

impl PartDatabase {
    /// Create an empty part database
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    /// The built-in database embedded in the library
    pub fn builtin() -> &'static PartDatabase {
        &BUILTIN
    }

    /// Load part definitions from a single RON file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, PartDbError> {
        let content = fs::read_to_string(path)?;
        self.load_ron(&content)
    }

    /// Load part definitions from a RON string
    pub fn load_ron(&mut self, content: &str) -> Result<usize, PartDbError> {
        let options = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME);
        let vendor_def: VendorDef = options.from_str(content)?;
        let count = vendor_def.parts.len();

        for part_def in vendor_def.parts {
            self.parts.push(build_part(part_def)?);
        }

        Ok(count)
    }

    /// Load all RON files from a directory
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, PartDbError> {
        let mut total = 0;

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "ron") {
                total += self.load_file(&path)?;
            }
        }

        Ok(total)
    }

    /// Get all parts in the database
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Get the number of parts in the database
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Check if the database is empty
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Find a part by identifier or full name
    ///
    /// Exact matches (case-insensitive) on the short id or the full name win;
    /// otherwise a case-insensitive id prefix is accepted when it is
    /// unambiguous.
    pub fn find(&self, key: &str) -> Option<&Part> {
        if let Some(p) = self.parts.iter().find(|p| {
            p.id.eq_ignore_ascii_case(key) || p.name.eq_ignore_ascii_case(key)
        }) {
            return Some(p);
        }

        let key_lower = key.to_lowercase();
        let mut hits = self
            .parts
            .iter()
            .filter(|p| p.id.to_lowercase().starts_with(&key_lower));
        match (hits.next(), hits.next()) {
            (Some(p), None) => Some(p),
            _ => None,
        }
    }

    /// Find parts by name (case-insensitive partial match)
    pub fn find_by_name(&self, name: &str) -> Vec<&Part> {
        let name_lower = name.to_lowercase();
        self.parts
            .iter()
            .filter(|p| p.name.to_lowercase().contains(&name_lower))
            .collect()
    }

    /// Iterate over all parts
    pub fn iter(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter()
    }
}

fn parse_op(part: &str, mem: &str, op: OpKind, s: &str) -> Result<OpcodeSpec, PartDbError> {
    OpcodeSpec::parse(s).map_err(|e| {
        PartDbError::Validation(format!("{part}/{mem} {op:?} opcode: {e}"))
    })
}

fn build_part(def: PartDef) -> Result<Part, PartDbError> {
    let mut memories = Vec::with_capacity(def.memories.len());
    for mem_def in def.memories {
        let size = mem_def.size.to_bytes();
        let page_size = mem_def.page_size.to_bytes();
        if size == 0 || page_size == 0 || size % page_size != 0 {
            return Err(PartDbError::Validation(format!(
                "{}/{}: size {size} is not a multiple of page size {page_size}",
                def.name, mem_def.name
            )));
        }

        let mut ops = HashMap::new();
        for (op, spec) in &mem_def.ops {
            ops.insert(*op, parse_op(&def.name, &mem_def.name, *op, spec)?);
        }

        memories.push(Memory {
            name: mem_def.name,
            kind: mem_def.kind,
            size,
            page_size,
            offset: mem_def.offset,
            ops,
        });
    }

    let mut ops = HashMap::new();
    if let Some(spec) = &def.chip_erase {
        ops.insert(
            OpKind::ChipErase,
            parse_op(&def.name, "chip", OpKind::ChipErase, spec)?,
        );
    }
    if let Some(spec) = &def.pgm_enable {
        ops.insert(
            OpKind::PgmEnable,
            parse_op(&def.name, "chip", OpKind::PgmEnable, spec)?,
        );
    }

    let config = def
        .config
        .into_iter()
        .map(|c| ConfigItem {
            name: c.name,
            memory: c.memory,
            mask: c.mask,
            shift: c.shift,
            values: c
                .values
                .into_iter()
                .map(|(name, value)| ConfigValue { name, value })
                .collect(),
        })
        .collect();

    Ok(Part {
        name: def.name,
        id: def.id,
        signature: [def.signature.0, def.signature.1, def.signature.2],
        boot_start: def.boot_start,
        memories,
        ops,
        config,
    })
}
