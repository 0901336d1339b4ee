//! AVR relocation kinds
//!
//! Each kind is a pure function from `(target, pc, instruction bytes)` to
//! patched instruction bytes. Instructions are little-endian 16-bit words;
//! program-memory targets are byte addresses that the word-addressed kinds
//! shift right by one.
//!
//! Numbering follows the AVR ELF ABI so images produced from ordinary
//! object files keep their relocation types.

use std::fmt;

/// Why a patch could not be applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// Value does not fit the instruction field
    Overflow { value: i64 },
    /// Word-addressed target at an odd byte address
    Misaligned { target: u32 },
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { value } => write!(f, "value {:#x} does not fit field", value),
            Self::Misaligned { target } => write!(f, "target {:#x} is not word aligned", target),
        }
    }
}

/// Supported relocation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelocationKind {
    /// 32-bit absolute data word
    Abs32 = 1,
    /// 7-bit PC-relative conditional branch (BRxx)
    Pcrel7 = 2,
    /// 12-bit PC-relative jump/call (RJMP/RCALL)
    Pcrel13 = 3,
    /// 16-bit absolute byte address
    Abs16 = 4,
    /// 16-bit absolute word address (function pointer)
    Abs16Pm = 5,
    Lo8Ldi = 6,
    Hi8Ldi = 7,
    Hh8Ldi = 8,
    Lo8LdiNeg = 9,
    Hi8LdiNeg = 10,
    Hh8LdiNeg = 11,
    Lo8LdiPm = 12,
    Hi8LdiPm = 13,
    Hh8LdiPm = 14,
    Lo8LdiPmNeg = 15,
    Hi8LdiPmNeg = 16,
    Hh8LdiPmNeg = 17,
    /// 22-bit word address in a 32-bit CALL/JMP
    Call = 18,
}

/// Which byte of the value an LDI immediate receives
#[derive(Debug, Clone, Copy)]
enum LdiByte {
    Lo,
    Hi,
    Hh,
}

impl RelocationKind {
    pub fn from_u8(code: u8) -> Option<Self> {
        use RelocationKind::*;
        Some(match code {
            1 => Abs32,
            2 => Pcrel7,
            3 => Pcrel13,
            4 => Abs16,
            5 => Abs16Pm,
            6 => Lo8Ldi,
            7 => Hi8Ldi,
            8 => Hh8Ldi,
            9 => Lo8LdiNeg,
            10 => Hi8LdiNeg,
            11 => Hh8LdiNeg,
            12 => Lo8LdiPm,
            13 => Hi8LdiPm,
            14 => Hh8LdiPm,
            15 => Lo8LdiPmNeg,
            16 => Hi8LdiPmNeg,
            17 => Hh8LdiPmNeg,
            18 => Call,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Bytes of instruction stream the kind rewrites
    pub fn width(self) -> usize {
        match self {
            Self::Abs32 | Self::Call => 4,
            _ => 2,
        }
    }

    /// Patch `insn` (only the first [`width`](Self::width) bytes matter)
    /// so that it refers to `target`. `pc` is the address of the instruction.
    pub fn patch(self, target: u32, pc: u32, insn: [u8; 4]) -> Result<[u8; 4], PatchError> {
        use RelocationKind::*;
        match self {
            Abs32 => Ok(patch_abs32(target, insn)),
            Abs16 => patch_abs16(target, insn),
            Abs16Pm => patch_abs16(word_addr(target)?, insn),
            Pcrel7 => patch_branch7(target, pc, insn),
            Pcrel13 => patch_rjmp(target, pc, insn),
            Call => patch_call(target, insn),
            Lo8Ldi => Ok(patch_ldi(target, LdiByte::Lo, insn)),
            Hi8Ldi => Ok(patch_ldi(target, LdiByte::Hi, insn)),
            Hh8Ldi => Ok(patch_ldi(target, LdiByte::Hh, insn)),
            Lo8LdiNeg => Ok(patch_ldi(target.wrapping_neg(), LdiByte::Lo, insn)),
            Hi8LdiNeg => Ok(patch_ldi(target.wrapping_neg(), LdiByte::Hi, insn)),
            Hh8LdiNeg => Ok(patch_ldi(target.wrapping_neg(), LdiByte::Hh, insn)),
            Lo8LdiPm => Ok(patch_ldi(word_addr(target)?, LdiByte::Lo, insn)),
            Hi8LdiPm => Ok(patch_ldi(word_addr(target)?, LdiByte::Hi, insn)),
            Hh8LdiPm => Ok(patch_ldi(word_addr(target)?, LdiByte::Hh, insn)),
            Lo8LdiPmNeg => Ok(patch_ldi(word_addr(target)?.wrapping_neg(), LdiByte::Lo, insn)),
            Hi8LdiPmNeg => Ok(patch_ldi(word_addr(target)?.wrapping_neg(), LdiByte::Hi, insn)),
            Hh8LdiPmNeg => Ok(patch_ldi(word_addr(target)?.wrapping_neg(), LdiByte::Hh, insn)),
        }
    }
}

impl fmt::Display for RelocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Abs32 => "R_AVR_32",
            Self::Pcrel7 => "R_AVR_7_PCREL",
            Self::Pcrel13 => "R_AVR_13_PCREL",
            Self::Abs16 => "R_AVR_16",
            Self::Abs16Pm => "R_AVR_16_PM",
            Self::Lo8Ldi => "R_AVR_LO8_LDI",
            Self::Hi8Ldi => "R_AVR_HI8_LDI",
            Self::Hh8Ldi => "R_AVR_HH8_LDI",
            Self::Lo8LdiNeg => "R_AVR_LO8_LDI_NEG",
            Self::Hi8LdiNeg => "R_AVR_HI8_LDI_NEG",
            Self::Hh8LdiNeg => "R_AVR_HH8_LDI_NEG",
            Self::Lo8LdiPm => "R_AVR_LO8_LDI_PM",
            Self::Hi8LdiPm => "R_AVR_HI8_LDI_PM",
            Self::Hh8LdiPm => "R_AVR_HH8_LDI_PM",
            Self::Lo8LdiPmNeg => "R_AVR_LO8_LDI_PM_NEG",
            Self::Hi8LdiPmNeg => "R_AVR_HI8_LDI_PM_NEG",
            Self::Hh8LdiPmNeg => "R_AVR_HH8_LDI_PM_NEG",
            Self::Call => "R_AVR_CALL",
        };
        f.write_str(name)
    }
}

fn word_addr(target: u32) -> Result<u32, PatchError> {
    if target & 1 != 0 {
        return Err(PatchError::Misaligned { target });
    }
    Ok(target >> 1)
}

fn load_word(insn: &[u8; 4], at: usize) -> u16 {
    u16::from_le_bytes([insn[at], insn[at + 1]])
}

fn store_word(insn: &mut [u8; 4], at: usize, word: u16) {
    insn[at..at + 2].copy_from_slice(&word.to_le_bytes());
}

fn patch_abs32(value: u32, mut insn: [u8; 4]) -> [u8; 4] {
    insn.copy_from_slice(&value.to_le_bytes());
    insn
}

fn patch_abs16(value: u32, mut insn: [u8; 4]) -> Result<[u8; 4], PatchError> {
    let value = u16::try_from(value).map_err(|_| PatchError::Overflow {
        value: i64::from(value),
    })?;
    store_word(&mut insn, 0, value);
    Ok(insn)
}

/// `LDI Rd, K`: `1110 KKKK dddd KKKK`
fn patch_ldi(value: u32, byte: LdiByte, mut insn: [u8; 4]) -> [u8; 4] {
    let k = match byte {
        LdiByte::Lo => value,
        LdiByte::Hi => value >> 8,
        LdiByte::Hh => value >> 16,
    } as u16
        & 0xFF;
    let word = (load_word(&insn, 0) & 0xF0F0) | (k & 0x0F) | ((k & 0xF0) << 4);
    store_word(&mut insn, 0, word);
    insn
}

/// Signed word distance from the instruction after `pc` to `target`
fn word_delta(target: u32, pc: u32) -> Result<i64, PatchError> {
    let delta = i64::from(target) - (i64::from(pc) + 2);
    if delta & 1 != 0 {
        return Err(PatchError::Misaligned { target });
    }
    Ok(delta >> 1)
}

/// `BRxx k`: `1111 0Xkk kkkk kXXX`, k signed 7-bit words
fn patch_branch7(target: u32, pc: u32, mut insn: [u8; 4]) -> Result<[u8; 4], PatchError> {
    let delta = word_delta(target, pc)?;
    if !(-64..=63).contains(&delta) {
        return Err(PatchError::Overflow { value: delta });
    }
    let word = (load_word(&insn, 0) & 0xFC07) | (((delta as u16) & 0x7F) << 3);
    store_word(&mut insn, 0, word);
    Ok(insn)
}

/// `RJMP/RCALL k`: `110X kkkk kkkk kkkk`, k signed 12-bit words
fn patch_rjmp(target: u32, pc: u32, mut insn: [u8; 4]) -> Result<[u8; 4], PatchError> {
    let delta = word_delta(target, pc)?;
    if !(-2048..=2047).contains(&delta) {
        return Err(PatchError::Overflow { value: delta });
    }
    let word = (load_word(&insn, 0) & 0xF000) | ((delta as u16) & 0x0FFF);
    store_word(&mut insn, 0, word);
    Ok(insn)
}

/// `CALL/JMP k`: `1001 010k kkkk 11Xk` + `kkkk kkkk kkkk kkkk`, k 22-bit words
fn patch_call(target: u32, mut insn: [u8; 4]) -> Result<[u8; 4], PatchError> {
    let k = word_addr(target)?;
    if k > 0x3F_FFFF {
        return Err(PatchError::Overflow {
            value: i64::from(k),
        });
    }
    let high = ((k >> 16) & 0x01) as u16 | ((((k >> 17) & 0x1F) as u16) << 4);
    let first = (load_word(&insn, 0) & 0xFE0E) | high;
    store_word(&mut insn, 0, first);
    store_word(&mut insn, 2, (k & 0xFFFF) as u16);
    Ok(insn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use RelocationKind::*;

    const LDI_R24: [u8; 4] = [0x80, 0xE0, 0, 0];
    const RCALL: [u8; 4] = [0x00, 0xD0, 0, 0];
    const BRNE: [u8; 4] = [0x01, 0xF4, 0, 0];
    const CALL: [u8; 4] = [0x0E, 0x94, 0, 0];

    fn two(kind: RelocationKind, target: u32, pc: u32, insn: [u8; 4]) -> [u8; 2] {
        let out = kind.patch(target, pc, insn).unwrap();
        [out[0], out[1]]
    }

    #[test]
    fn test_codes_round_trip() {
        for code in 1..=18 {
            let kind = RelocationKind::from_u8(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(RelocationKind::from_u8(0).is_none());
        assert!(RelocationKind::from_u8(19).is_none());
        assert_eq!(Call.to_string(), "R_AVR_CALL");
    }

    #[test]
    fn test_abs16() {
        // Symbol 0x1000 + addend 4
        assert_eq!(two(Abs16, 0x1004, 0, [0; 4]), [0x04, 0x10]);
        assert_eq!(
            Abs16.patch(0x1_0000, 0, [0; 4]),
            Err(PatchError::Overflow { value: 0x1_0000 })
        );
    }

    #[test]
    fn test_abs16_pm_is_word_address() {
        assert_eq!(two(Abs16Pm, 0x1004, 0, [0; 4]), [0x02, 0x08]);
        // Above 64 KiB still fits once shifted
        assert_eq!(two(Abs16Pm, 0x1_2340, 0, [0; 4]), [0xA0, 0x91]);
        assert_eq!(
            Abs16Pm.patch(0x1005, 0, [0; 4]),
            Err(PatchError::Misaligned { target: 0x1005 })
        );
    }

    #[test]
    fn test_abs32() {
        assert_eq!(
            Abs32.patch(0x0001_2345, 0, [0xFF; 4]).unwrap(),
            [0x45, 0x23, 0x01, 0x00]
        );
    }

    #[test]
    fn test_ldi_byte_slices() {
        assert_eq!(two(Lo8Ldi, 0x1234, 0, LDI_R24), [0x84, 0xE3]);
        assert_eq!(two(Hi8Ldi, 0x1234, 0, LDI_R24), [0x82, 0xE1]);
        assert_eq!(two(Hh8Ldi, 0x12_3456, 0, LDI_R24), [0x82, 0xE1]);
    }

    #[test]
    fn test_ldi_keeps_register_bits() {
        // LDI r31, 0xFF -> 1110 1111 1111 1111; patch to 0x00 keeps d = 0xF
        assert_eq!(two(Lo8Ldi, 0, 0, [0xFF, 0xEF, 0, 0]), [0xF0, 0xE0]);
    }

    #[test]
    fn test_ldi_negated() {
        // -1 = 0xFF..FF
        assert_eq!(two(Lo8LdiNeg, 1, 0, LDI_R24), [0x8F, 0xEF]);
        // -0x0100 = 0x..FF00: low byte 0x00, high byte 0xFF
        assert_eq!(two(Lo8LdiNeg, 0x0100, 0, LDI_R24), [0x80, 0xE0]);
        assert_eq!(two(Hi8LdiNeg, 0x0100, 0, LDI_R24), [0x8F, 0xEF]);
        // -0x12_3456 = 0xFFED_CBAA
        assert_eq!(two(Hh8LdiNeg, 0x12_3456, 0, LDI_R24), [0x8D, 0xEE]);
    }

    #[test]
    fn test_ldi_program_memory() {
        // 0x1234 bytes = 0x091A words
        assert_eq!(two(Lo8LdiPm, 0x1234, 0, LDI_R24), [0x8A, 0xE1]);
        assert_eq!(two(Hi8LdiPm, 0x1234, 0, LDI_R24), [0x89, 0xE0]);
        assert_eq!(two(Hh8LdiPm, 0x2_0000, 0, LDI_R24), [0x81, 0xE0]);
    }

    #[test]
    fn test_ldi_program_memory_negated() {
        // -0x091A words = 0xFFFF_F6E6
        assert_eq!(two(Lo8LdiPmNeg, 0x1234, 0, LDI_R24), [0x86, 0xEE]);
        assert_eq!(two(Hi8LdiPmNeg, 0x1234, 0, LDI_R24), [0x86, 0xEF]);
        // -0x1_2340 words = 0xFFFE_DCC0
        assert_eq!(two(Hh8LdiPmNeg, 0x2_4680, 0, LDI_R24), [0x8E, 0xEF]);
    }

    #[test]
    fn test_ldi_program_memory_rejects_odd_target() {
        for kind in [Lo8LdiPm, Hi8LdiPm, Hh8LdiPm, Lo8LdiPmNeg, Hi8LdiPmNeg, Hh8LdiPmNeg] {
            assert_eq!(
                kind.patch(0x1235, 0, LDI_R24),
                Err(PatchError::Misaligned { target: 0x1235 }),
                "{kind}"
            );
        }
        // Data-space LDI has no alignment rule
        assert_eq!(two(Lo8Ldi, 0x1235, 0, LDI_R24), [0x85, 0xE3]);
    }

    #[test]
    fn test_rcall_relative() {
        assert_eq!(two(Pcrel13, 0x200, 0x100, RCALL), [0x7F, 0xD0]);
        // Calling itself is one word back
        assert_eq!(two(Pcrel13, 0x100, 0x100, RCALL), [0xFF, 0xDF]);
        assert!(matches!(
            Pcrel13.patch(0x100 + 2 + 4096, 0x100, RCALL),
            Err(PatchError::Overflow { value: 2048 })
        ));
        assert!(matches!(
            Pcrel13.patch(0x201, 0x100, RCALL),
            Err(PatchError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_branch_relative() {
        assert_eq!(two(Pcrel7, 0x110, 0x100, BRNE), [0x39, 0xF4]);
        // -64 words is the furthest backward branch
        let back = 0x100 + 2 - 128;
        assert_eq!(two(Pcrel7, back, 0x100, BRNE), [0x01, 0xF6]);
        assert!(matches!(
            Pcrel7.patch(0x100 + 2 + 128, 0x100, BRNE),
            Err(PatchError::Overflow { value: 64 })
        ));
    }

    #[test]
    fn test_call_absolute() {
        assert_eq!(Call.patch(0x1_2340, 0, CALL).unwrap(), [0x0E, 0x94, 0xA0, 0x91]);
        // Bit 16 of the word address lands in bit 0 of the first word
        assert_eq!(Call.patch(0x2_0000, 0, CALL).unwrap(), [0x0F, 0x94, 0x00, 0x00]);
        // Bits 17..21 land in bits 4..8
        assert_eq!(Call.patch(0x4_0000, 0, CALL).unwrap(), [0x1E, 0x94, 0x00, 0x00]);
        assert!(matches!(
            Call.patch(0x801, 0, CALL),
            Err(PatchError::Misaligned { target: 0x801 })
        ));
    }
}
