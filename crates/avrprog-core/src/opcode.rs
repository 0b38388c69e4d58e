//! Bit-level programming-command codec
//!
//! Serial programming instructions are 32-bit words whose individual bits
//! carry constants, address bits, input data, or output data, depending on
//! the part. Rather than hand-writing the bit shuffling per part and per
//! operation, each opcode is described declaratively in the part database as
//! a 32-entry bit table, and this module assembles command bytes from it and
//! picks response data back out.
//!
//! The command word is handled as 4 bytes in big-endian order: bit 0 is the
//! least significant bit of the last byte, bit 31 the most significant bit of
//! the first byte.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::part::Memory;

/// Number of bits in a programming command word
pub const CMD_BITS: usize = 32;
/// Number of bytes in a programming command word
pub const CMD_LEN: usize = 4;

/// Role of a single bit within a command word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmdBit {
    /// Don't-care bit, transmitted as 0
    #[default]
    Ignore,
    /// Fixed value bit
    Value(bool),
    /// Carries the given bit of the address operand
    Address(u8),
    /// Carries the given bit of the data byte being written
    Input(u8),
    /// The response carries the given bit of the data byte being read
    Output(u8),
}

/// Operation classes an opcode can implement
///
/// `Read`/`Write` operate on single bytes, `PagedLoad`/`WritePage` fill and
/// commit the device-side page buffer, `LoadExtAddr` loads the extended
/// address byte for parts larger than 128 KiB. `ChipErase` and `PgmEnable`
/// take no address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum OpKind {
    /// Read one byte
    Read,
    /// Write one byte
    Write,
    /// Load one byte into the device page buffer
    PagedLoad,
    /// Load the extended address byte
    LoadExtAddr,
    /// Commit the device page buffer
    WritePage,
    /// Erase the whole chip
    ChipErase,
    /// Enter programming mode
    PgmEnable,
}

/// Result of asserting the address bits required by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrBitsOutcome {
    /// The opcode supplies every address bit the operation needs
    Covered,
    /// The lowest required address bit the opcode does not carry
    ///
    /// Advisory: the caller decides whether a missing bit is fatal (it
    /// usually means the memory is too large for the opcode the part
    /// database provided).
    MissingBit(u8),
}

/// Declarative description of one programming instruction
///
/// Bits are indexed by their position in the 32-bit command word (0 = LSB of
/// the last command byte). Nothing here deduplicates descriptors: if two
/// entries claim the same address or data bit, the last one written wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeSpec {
    bits: [CmdBit; CMD_BITS],
}

/// Locate a command-word bit: returns (byte index, mask within that byte)
fn bit_pos(n: usize) -> (usize, u8) {
    (CMD_LEN - 1 - n / 8, 1 << (n % 8))
}

fn set_bit(cmd: &mut [u8; CMD_LEN], n: usize, on: bool) {
    let (byte, mask) = bit_pos(n);
    if on {
        cmd[byte] |= mask;
    } else {
        cmd[byte] &= !mask;
    }
}

fn get_bit(bytes: &[u8; CMD_LEN], n: usize) -> bool {
    let (byte, mask) = bit_pos(n);
    bytes[byte] & mask != 0
}

/// floor(log2(x)) for x > 0
fn intlog2(x: u32) -> u8 {
    (31 - x.leading_zeros()) as u8
}

impl OpcodeSpec {
    /// Build a spec directly from descriptors indexed by command-word bit
    pub fn from_bits(bits: [CmdBit; CMD_BITS]) -> Self {
        Self { bits }
    }

    /// Parse an MSB-first bit string from the part database
    ///
    /// The string consists of whitespace-separated tokens. A token is either
    /// a run of single-bit characters (`0`/`1` constants, `x` ignore, `a`,
    /// `i`, `o` address/input/output), or one explicitly numbered bit
    /// such as `a16`. Unnumbered `a` bits must sit in the 16-bit address
    /// field (the middle two command bytes) and take their number from their
    /// position in it; unnumbered `i`/`o` bits take their position within
    /// their byte. 32 bits total are required.
    ///
    /// ```
    /// use avrprog_core::opcode::OpcodeSpec;
    /// let op = OpcodeSpec::parse("0010 0000 00aa aaaa aaaa aaaa oooo oooo").unwrap();
    /// assert_eq!(op.output_byte_index(), Some(3));
    /// ```
    pub fn parse(s: &str) -> Result<Self> {
        let mut bits = [CmdBit::Ignore; CMD_BITS];
        let mut pos = 0usize; // MSB-first position: 0 => word bit 31

        for tok in s.split_whitespace() {
            if let Some(bit) = parse_numbered_token(tok)? {
                if pos >= CMD_BITS {
                    return Err(Error::InvalidOpcodeSpec(format!(
                        "more than {CMD_BITS} bits in \"{s}\""
                    )));
                }
                bits[CMD_BITS - 1 - pos] = bit;
                pos += 1;
                continue;
            }
            for c in tok.chars() {
                if pos >= CMD_BITS {
                    return Err(Error::InvalidOpcodeSpec(format!(
                        "more than {CMD_BITS} bits in \"{s}\""
                    )));
                }
                let word_bit = CMD_BITS - 1 - pos;
                bits[word_bit] = match c {
                    '0' => CmdBit::Value(false),
                    '1' => CmdBit::Value(true),
                    'x' => CmdBit::Ignore,
                    'a' => {
                        // position within the 16-bit address field
                        if !(8..24).contains(&word_bit) {
                            return Err(Error::InvalidOpcodeSpec(format!(
                                "unnumbered address bit outside the address field in \"{s}\" \
                                 (use an explicit bit number, e.g. a16)"
                            )));
                        }
                        CmdBit::Address((word_bit - 8) as u8)
                    }
                    'i' => CmdBit::Input((word_bit % 8) as u8),
                    'o' => CmdBit::Output((word_bit % 8) as u8),
                    _ => {
                        return Err(Error::InvalidOpcodeSpec(format!(
                            "invalid bit character '{c}' in \"{s}\""
                        )))
                    }
                };
                pos += 1;
            }
        }

        if pos != CMD_BITS {
            return Err(Error::InvalidOpcodeSpec(format!(
                "expected {CMD_BITS} bits, got {pos} in \"{s}\""
            )));
        }
        Ok(Self { bits })
    }

    /// Write all constant bits into `cmd`, clearing ignored bits
    pub fn set_constant_bits(&self, cmd: &mut [u8; CMD_LEN]) {
        for (n, bit) in self.bits.iter().enumerate() {
            match *bit {
                CmdBit::Value(v) => set_bit(cmd, n, v),
                CmdBit::Ignore => set_bit(cmd, n, false),
                _ => {}
            }
        }
    }

    /// Copy every address bit the spec carries from `addr` into `cmd`
    pub fn set_address_bits(&self, cmd: &mut [u8; CMD_LEN], addr: u32) {
        for (n, bit) in self.bits.iter().enumerate() {
            if let CmdBit::Address(b) = *bit {
                set_bit(cmd, n, (addr >> b) & 1 != 0);
            }
        }
    }

    /// Assert address bits for a specific operation class
    ///
    /// Computes the address-bit range `[lo, hi]` the operation actually
    /// needs for this memory's geometry (flash sizes are halved, since
    /// flash is word-addressed over the wire) and asserts only bits inside
    /// that range; address bits outside it are forced to 0. The range is
    /// clamped to bit 15 except for `LoadExtAddr`, which exists precisely to
    /// carry bits 16 and up.
    ///
    /// Returns whether the spec covers every required bit; a missing bit is
    /// advisory, not an error.
    pub fn set_address_bits_for_op(
        &self,
        mem: &Memory,
        op: OpKind,
        cmd: &mut [u8; CMD_LEN],
        addr: u32,
    ) -> AddrBitsOutcome {
        let range = required_addr_bits(mem, op);

        let mut have = [false; CMD_BITS];
        for (n, bit) in self.bits.iter().enumerate() {
            if let CmdBit::Address(b) = *bit {
                have[b as usize % CMD_BITS] = true;
                let in_range = range.is_some_and(|(lo, hi)| b >= lo && b <= hi);
                set_bit(cmd, n, in_range && (addr >> b) & 1 != 0);
            }
        }

        if let Some((lo, hi)) = range {
            for b in lo..=hi {
                if !have[b as usize] {
                    return AddrBitsOutcome::MissingBit(b);
                }
            }
        }
        AddrBitsOutcome::Covered
    }

    /// Copy every input-data bit from `data` into `cmd`
    pub fn set_input_bits(&self, cmd: &mut [u8; CMD_LEN], data: u8) {
        for (n, bit) in self.bits.iter().enumerate() {
            if let CmdBit::Input(b) = *bit {
                set_bit(cmd, n, (data >> b) & 1 != 0);
            }
        }
    }

    /// Extract output-data bits from a raw response into `data`
    ///
    /// Bits the spec does not cover are left as they are in the accumulator;
    /// callers zero it first.
    pub fn get_output_bits(&self, res: &[u8; CMD_LEN], data: &mut u8) {
        for (n, bit) in self.bits.iter().enumerate() {
            if let CmdBit::Output(b) = *bit {
                if get_bit(res, n) {
                    *data |= 1 << b;
                } else {
                    *data &= !(1 << b);
                }
            }
        }
    }

    /// Which command-word byte holds the first output bit, if any
    pub fn output_byte_index(&self) -> Option<usize> {
        self.bits
            .iter()
            .position(|b| matches!(b, CmdBit::Output(_)))
            .map(|n| CMD_LEN - 1 - n / 8)
    }

    /// The bit descriptors, indexed by command-word bit number
    pub fn bits(&self) -> &[CmdBit; CMD_BITS] {
        &self.bits
    }
}

/// Address-bit range `[lo, hi]` an operation needs, `None` if it needs none
fn required_addr_bits(mem: &Memory, op: OpKind) -> Option<(u8, u8)> {
    // flash is word-addressed over the wire
    let shift = u32::from(mem.kind.is_flash());
    let mem_words = mem.size >> shift;
    let page_words = mem.page_size >> shift;

    let (lo, hi) = match op {
        OpKind::Read | OpKind::Write => {
            if mem_words <= 1 {
                return None;
            }
            (0, intlog2(mem_words - 1))
        }
        OpKind::PagedLoad => {
            if page_words <= 1 {
                return None;
            }
            (0, intlog2(page_words - 1))
        }
        OpKind::LoadExtAddr => {
            if mem_words <= 1 || intlog2(mem_words - 1) < 16 {
                return None;
            }
            (16, intlog2(mem_words - 1))
        }
        OpKind::WritePage => {
            if mem_words <= page_words || page_words == 0 {
                return None;
            }
            (intlog2(page_words), intlog2(mem_words - 1))
        }
        OpKind::ChipErase | OpKind::PgmEnable => return None,
    };

    // serial programming carries 16 address bits; anything above goes
    // through the extended address byte
    let hi = if op == OpKind::LoadExtAddr { hi } else { hi.min(15) };
    if lo > hi {
        return None;
    }
    Some((lo, hi))
}

/// Parse an explicitly numbered token like `a16`; `Ok(None)` if the token is
/// not of that form
fn parse_numbered_token(tok: &str) -> Result<Option<CmdBit>> {
    let mut chars = tok.chars();
    let kind = match chars.next() {
        Some(c @ ('a' | 'i' | 'o')) => c,
        _ => return Ok(None),
    };
    let rest = chars.as_str();
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    let n: u32 = rest
        .parse()
        .map_err(|_| Error::InvalidOpcodeSpec(format!("bad bit number in \"{tok}\"")))?;
    let limit = if kind == 'a' { 31 } else { 7 };
    if n > limit {
        return Err(Error::InvalidOpcodeSpec(format!(
            "bit number {n} out of range in \"{tok}\""
        )));
    }
    Ok(Some(match kind {
        'a' => CmdBit::Address(n as u8),
        'i' => CmdBit::Input(n as u8),
        _ => CmdBit::Output(n as u8),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{Memory, MemoryKind};

    fn flash_mem(size: u32, page_size: u32) -> Memory {
        Memory::new("flash", MemoryKind::Flash, size, page_size, 0)
    }

    fn eeprom_mem(size: u32, page_size: u32) -> Memory {
        Memory::new("eeprom", MemoryKind::Eeprom, size, page_size, 0)
    }

    #[test]
    fn parse_read_opcode() {
        let op = OpcodeSpec::parse("0010 0000 00aa aaaa aaaa aaaa oooo oooo").unwrap();
        let bits = op.bits();
        // constants in the top byte
        assert_eq!(bits[29], CmdBit::Value(true));
        assert_eq!(bits[31], CmdBit::Value(false));
        // address bits 0..=13 positionally in the middle bytes
        assert_eq!(bits[8], CmdBit::Address(0));
        assert_eq!(bits[21], CmdBit::Address(13));
        assert_eq!(bits[22], CmdBit::Value(false));
        // output byte
        assert_eq!(bits[0], CmdBit::Output(0));
        assert_eq!(bits[7], CmdBit::Output(7));
        assert_eq!(op.output_byte_index(), Some(3));
    }

    #[test]
    fn parse_explicit_numbered_bits() {
        let op = OpcodeSpec::parse(
            "0100 1101 0000 0000 0000 0000 a23 a22 a21 a20 a19 a18 a17 a16",
        )
        .unwrap();
        assert_eq!(op.bits()[0], CmdBit::Address(16));
        assert_eq!(op.bits()[7], CmdBit::Address(23));
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(OpcodeSpec::parse("0010 0000").is_err());
        assert!(OpcodeSpec::parse("0010 0000 00aa aaaa aaaa aaaa oooo oooo 1").is_err());
    }

    #[test]
    fn parse_rejects_stray_address_bit() {
        // unnumbered 'a' in the first byte is not in the address field
        assert!(OpcodeSpec::parse("a000 0000 0000 0000 0000 0000 0000 0000").is_err());
    }

    #[test]
    fn constant_bits_clear_ignored() {
        let op = OpcodeSpec::parse("1010 1100 100x xxxx xxxx xxxx xxxx xxxx").unwrap();
        let mut cmd = [0xff; 4];
        op.set_constant_bits(&mut cmd);
        assert_eq!(cmd, [0xac, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn address_bits_land_in_middle_bytes() {
        let op = OpcodeSpec::parse("0010 0000 00aa aaaa aaaa aaaa oooo oooo").unwrap();
        let mut cmd = [0u8; 4];
        op.set_address_bits(&mut cmd, 0x1234);
        assert_eq!(cmd, [0x00, 0x12, 0x34, 0x00]);
    }

    #[test]
    fn input_output_round_trip() {
        // synthetic opcode that writes a byte and a response that echoes it
        let op = OpcodeSpec::parse("1100 0000 00aa aaaa aaaa aaaa iiii iiii").unwrap();
        let echo = OpcodeSpec::parse("0000 0000 0000 0000 0000 0000 oooo oooo").unwrap();

        let mut cmd = [0u8; 4];
        op.set_constant_bits(&mut cmd);
        op.set_address_bits(&mut cmd, 0x155);
        op.set_input_bits(&mut cmd, 0x5a);
        assert_eq!(cmd, [0xc0, 0x01, 0x55, 0x5a]);

        let mut data = 0u8;
        echo.get_output_bits(&cmd, &mut data);
        assert_eq!(data, 0x5a);
    }

    #[test]
    fn for_op_masks_bits_outside_range() {
        // paged load on a 128-byte-page flash needs word bits 0..=5 only
        let op = OpcodeSpec::parse("0100 0000 000x xxxx xxaa aaaa iiii iiii").unwrap();
        let mem = flash_mem(32 * 1024, 128);
        let mut cmd = [0u8; 4];
        let out = op.set_address_bits_for_op(&mem, OpKind::PagedLoad, &mut cmd, 0xffff);
        assert_eq!(out, AddrBitsOutcome::Covered);
        assert_eq!(cmd[2], 0x3f);
    }

    #[test]
    fn for_op_write_page_uses_page_number_bits() {
        let op = OpcodeSpec::parse("0100 1100 00aa aaaa aaxx xxxx xxxx xxxx").unwrap();
        let mem = flash_mem(32 * 1024, 128);
        let mut cmd = [0u8; 4];
        // word address of the second page: 64
        let out = op.set_address_bits_for_op(&mem, OpKind::WritePage, &mut cmd, 64);
        assert_eq!(out, AddrBitsOutcome::Covered);
        assert_eq!(cmd, [0x00, 0x00, 0x40, 0x00]);
    }

    #[test]
    fn for_op_reports_lowest_missing_bit() {
        // read opcode with only 10 address bits on a memory that needs 13
        let op = OpcodeSpec::parse("0010 0000 0000 00aa aaaa aaaa oooo oooo").unwrap();
        let mem = flash_mem(32 * 1024, 128);
        let mut cmd = [0u8; 4];
        let out = op.set_address_bits_for_op(&mem, OpKind::Read, &mut cmd, 0);
        assert_eq!(out, AddrBitsOutcome::MissingBit(10));
    }

    #[test]
    fn for_op_chip_erase_needs_no_address() {
        let op = OpcodeSpec::parse("1010 1100 100x xxxx xxxx xxxx xxxx xxxx").unwrap();
        let mem = flash_mem(32 * 1024, 128);
        let mut cmd = [0u8; 4];
        let out = op.set_address_bits_for_op(&mem, OpKind::ChipErase, &mut cmd, 0xdead);
        assert_eq!(out, AddrBitsOutcome::Covered);
        assert_eq!(cmd, [0, 0, 0, 0]);
    }

    #[test]
    fn for_op_ext_addr_range() {
        let op = OpcodeSpec::parse(
            "0100 1101 0000 0000 0000 0000 a23 a22 a21 a20 a19 a18 a17 a16",
        )
        .unwrap();
        // 256 KiB flash: word addresses up to 2^17 - 1, so bit 16 is needed
        let mem = flash_mem(256 * 1024, 256);
        let mut cmd = [0u8; 4];
        let out = op.set_address_bits_for_op(&mem, OpKind::LoadExtAddr, &mut cmd, 0x1_0000);
        assert_eq!(out, AddrBitsOutcome::Covered);
        assert_eq!(cmd[3], 0x01);

        // small flash needs no extended address at all
        let small = flash_mem(32 * 1024, 128);
        let mut cmd = [0u8; 4];
        let out = op.set_address_bits_for_op(&small, OpKind::LoadExtAddr, &mut cmd, 0);
        assert_eq!(out, AddrBitsOutcome::Covered);
    }

    #[test]
    fn for_op_eeprom_is_byte_addressed() {
        let op = OpcodeSpec::parse("1010 0000 000x xxaa aaaa aaaa oooo oooo").unwrap();
        let mem = eeprom_mem(1024, 4);
        let mut cmd = [0u8; 4];
        let out = op.set_address_bits_for_op(&mem, OpKind::Read, &mut cmd, 0x3ff);
        assert_eq!(out, AddrBitsOutcome::Covered);
        assert_eq!(cmd[1], 0x03);
        assert_eq!(cmd[2], 0xff);
    }
}
