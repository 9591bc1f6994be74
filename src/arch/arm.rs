//! ARM (AArch32) relocation kinds and instruction patching.
//!
//! Covers every relocation kind the platform's object files use: plain data
//! words, PC-relative words, ARM and Thumb-2 branch encodings, and the
//! MOVW/MOVT immediate scatter. The patch functions are pure: they take the
//! raw instruction word and the resolved addresses and return the patched
//! word, without touching any memory themselves.

use crate::{Error, Result, patch_error};
use object::elf::{
    EM_ARM, R_ARM_ABS32, R_ARM_CALL, R_ARM_JUMP24, R_ARM_MOVT_ABS, R_ARM_MOVW_ABS_NC, R_ARM_NONE,
    R_ARM_PREL31, R_ARM_REL32, R_ARM_TARGET1, R_ARM_TARGET2, R_ARM_THM_MOVT_ABS,
    R_ARM_THM_MOVW_ABS_NC, R_ARM_THM_PC22, R_ARM_V4BX,
};

// `R_ARM_THM_CALL` in the current ABI; `object` carries the older table
// name.
const R_ARM_THM_CALL: u32 = R_ARM_THM_PC22;

/// The ELF machine type for this platform's modules.
pub const EM_ARCH: u16 = EM_ARM;

/// Relocation kinds used by the platform's ARM object files.
///
/// This is a closed set: any other code in an input stream is rejected at
/// the conversion boundary rather than passed through.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// `R_ARM_NONE`; never stored in the index.
    #[default]
    None,
    /// `R_ARM_ABS32`: absolute 32-bit data word.
    Abs32,
    /// `R_ARM_REL32`: PC-relative 32-bit data word.
    Rel32,
    /// `R_ARM_THM_CALL`: Thumb-2 BL/BLX.
    ThmCall,
    /// `R_ARM_CALL`: ARM BL/BLX.
    Call,
    /// `R_ARM_JUMP24`: ARM B.
    Jump24,
    /// `R_ARM_TARGET1`: treated as `Abs32` on this platform.
    Target1,
    /// `R_ARM_TARGET2`: treated as `Rel32` on this platform.
    Target2,
    /// `R_ARM_PREL31`: 31-bit PC-relative, top bit preserved.
    Prel31,
    /// `R_ARM_MOVW_ABS_NC`: low half of an ARM MOVW/MOVT address load.
    MovwAbsNc,
    /// `R_ARM_MOVT_ABS`: high half of an ARM MOVW/MOVT address load.
    MovtAbs,
    /// `R_ARM_THM_MOVW_ABS_NC`: low half, Thumb-2 encoding.
    ThmMovwAbsNc,
    /// `R_ARM_THM_MOVT_ABS`: high half, Thumb-2 encoding.
    ThmMovtAbs,
    /// `R_ARM_V4BX` marker; never stored in the index.
    V4bx,
}

impl RelocKind {
    /// Map an ELF `r_type` code into the closed kind set.
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            R_ARM_NONE => RelocKind::None,
            R_ARM_ABS32 => RelocKind::Abs32,
            R_ARM_REL32 => RelocKind::Rel32,
            R_ARM_THM_CALL => RelocKind::ThmCall,
            R_ARM_CALL => RelocKind::Call,
            R_ARM_JUMP24 => RelocKind::Jump24,
            R_ARM_TARGET1 => RelocKind::Target1,
            R_ARM_TARGET2 => RelocKind::Target2,
            R_ARM_PREL31 => RelocKind::Prel31,
            R_ARM_MOVW_ABS_NC => RelocKind::MovwAbsNc,
            R_ARM_MOVT_ABS => RelocKind::MovtAbs,
            R_ARM_THM_MOVW_ABS_NC => RelocKind::ThmMovwAbsNc,
            R_ARM_THM_MOVT_ABS => RelocKind::ThmMovtAbs,
            R_ARM_V4BX => RelocKind::V4bx,
            _ => return Err(Error::UnsupportedReloc { code }),
        })
    }

    /// The ELF `r_type` code of this kind.
    pub fn code(self) -> u32 {
        match self {
            RelocKind::None => R_ARM_NONE,
            RelocKind::Abs32 => R_ARM_ABS32,
            RelocKind::Rel32 => R_ARM_REL32,
            RelocKind::ThmCall => R_ARM_THM_CALL,
            RelocKind::Call => R_ARM_CALL,
            RelocKind::Jump24 => R_ARM_JUMP24,
            RelocKind::Target1 => R_ARM_TARGET1,
            RelocKind::Target2 => R_ARM_TARGET2,
            RelocKind::Prel31 => R_ARM_PREL31,
            RelocKind::MovwAbsNc => R_ARM_MOVW_ABS_NC,
            RelocKind::MovtAbs => R_ARM_MOVT_ABS,
            RelocKind::ThmMovwAbsNc => R_ARM_THM_MOVW_ABS_NC,
            RelocKind::ThmMovtAbs => R_ARM_THM_MOVT_ABS,
            RelocKind::V4bx => R_ARM_V4BX,
        }
    }

    /// MOVW/MOVT immediate-load family. These kinds carry their symbol
    /// explicitly in the compact stream and fold it into the checksum.
    pub fn is_mov_family(self) -> bool {
        matches!(
            self,
            RelocKind::MovwAbsNc
                | RelocKind::MovtAbs
                | RelocKind::ThmMovwAbsNc
                | RelocKind::ThmMovtAbs
        )
    }

    /// Kinds that replace a whole data word with an absolute address and are
    /// eligible for the batched fixup entry types (6-9).
    pub fn is_pointer(self) -> bool {
        matches!(self, RelocKind::Abs32 | RelocKind::Target1)
    }

    /// If this is the MOVW half of an address load, the matching MOVT kind
    /// and whether the pair is Thumb-encoded.
    pub(crate) fn mov_pair(self) -> Option<(RelocKind, bool)> {
        match self {
            RelocKind::MovwAbsNc => Some((RelocKind::MovtAbs, false)),
            RelocKind::ThmMovwAbsNc => Some((RelocKind::ThmMovtAbs, true)),
            _ => None,
        }
    }

    /// Human readable name, for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            RelocKind::None => "R_ARM_NONE",
            RelocKind::Abs32 => "R_ARM_ABS32",
            RelocKind::Rel32 => "R_ARM_REL32",
            RelocKind::ThmCall => "R_ARM_THM_CALL",
            RelocKind::Call => "R_ARM_CALL",
            RelocKind::Jump24 => "R_ARM_JUMP24",
            RelocKind::Target1 => "R_ARM_TARGET1",
            RelocKind::Target2 => "R_ARM_TARGET2",
            RelocKind::Prel31 => "R_ARM_PREL31",
            RelocKind::MovwAbsNc => "R_ARM_MOVW_ABS_NC",
            RelocKind::MovtAbs => "R_ARM_MOVT_ABS",
            RelocKind::ThmMovwAbsNc => "R_ARM_THM_MOVW_ABS_NC",
            RelocKind::ThmMovtAbs => "R_ARM_THM_MOVT_ABS",
            RelocKind::V4bx => "R_ARM_V4BX",
        }
    }
}

// Thumb-2 MOVW/MOVT skeletons, on the little-endian u32 read from memory
// (first halfword in the low 16 bits).
const THM_MOV_MASK: u32 = 0x8000_FBF0;
const THM_MOVW_BITS: u32 = 0x0000_F240;
const THM_MOVT_BITS: u32 = 0x0000_F2C0;

/// Patch `insn` for `kind`.
///
/// `S` is `symbol_vaddr + symbol_offset` and `P` is
/// `target_vaddr + target_offset`; both wrap on overflow, matching the
/// 32-bit address space of the target. 32-bit Thumb-2 instructions are
/// passed as the little-endian word read from memory, so the first halfword
/// sits in the low 16 bits.
pub fn patch(
    insn: u32,
    kind: RelocKind,
    target_offset: u32,
    symbol_vaddr: u32,
    symbol_offset: u32,
    target_vaddr: u32,
) -> Result<u32> {
    let s = symbol_vaddr.wrapping_add(symbol_offset);
    let p = target_vaddr.wrapping_add(target_offset);
    match kind {
        RelocKind::Abs32 | RelocKind::Target1 => Ok(s),
        RelocKind::Rel32 | RelocKind::Target2 => Ok(s.wrapping_sub(p)),
        RelocKind::Prel31 => Ok((insn & 0x8000_0000) | (s.wrapping_sub(p) & 0x7FFF_FFFF)),
        RelocKind::MovwAbsNc => Ok(encode_arm_mov(insn, s & 0xFFFF)),
        RelocKind::MovtAbs => Ok(encode_arm_mov(insn, s >> 16)),
        RelocKind::ThmMovwAbsNc => {
            encode_thumb_mov(insn, THM_MOVW_BITS, s & 0xFFFF, target_offset)
        }
        RelocKind::ThmMovtAbs => encode_thumb_mov(insn, THM_MOVT_BITS, s >> 16, target_offset),
        RelocKind::Call => encode_arm_branch(insn, s, p, true, target_offset),
        RelocKind::Jump24 => encode_arm_branch(insn, s, p, false, target_offset),
        RelocKind::ThmCall => encode_thumb_call(insn, s, p, target_offset),
        RelocKind::None | RelocKind::V4bx => Err(Error::UnsupportedReloc { code: kind.code() }),
    }
}

/// Scatter a 16-bit immediate into an ARM MOVW/MOVT: imm4 in bits [19:16],
/// imm12 in bits [11:0].
fn encode_arm_mov(insn: u32, imm16: u32) -> u32 {
    (insn & 0xFFF0_F000) | ((imm16 & 0xF000) << 4) | (imm16 & 0x0FFF)
}

/// Scatter a 16-bit immediate into a Thumb-2 MOVW/MOVT as i:imm4:imm3:imm8,
/// after checking the word against the expected opcode skeleton. Patching
/// anything else here would corrupt an unrelated instruction.
fn encode_thumb_mov(insn: u32, expect: u32, imm16: u32, target_offset: u32) -> Result<u32> {
    if insn & THM_MOV_MASK != expect {
        return Err(patch_error(
            target_offset,
            insn,
            "not a Thumb MOVW/MOVT instruction",
        ));
    }
    let hw1 = (insn & 0xFBF0) | (((imm16 >> 11) & 1) << 10) | ((imm16 >> 12) & 0xF);
    let hw2 = ((insn >> 16) & 0x0F00) | (((imm16 >> 8) & 0x7) << 12) | (imm16 & 0xFF);
    Ok((hw2 << 16) | hw1)
}

/// ARM BL/B 24-bit branch. A call to a Thumb target becomes BLX with the H
/// bit carrying the halfword offset, which requires an unconditional
/// instruction (condition nibble AL).
fn encode_arm_branch(insn: u32, s: u32, p: u32, is_call: bool, target_offset: u32) -> Result<u32> {
    let thumb = s & 1 != 0;
    let off = (s & !1).wrapping_sub(p).wrapping_sub(8) as i32;
    if !(-(1 << 25)..(1 << 25)).contains(&off) {
        return Err(patch_error(
            target_offset,
            insn,
            "branch offset out of range",
        ));
    }
    let imm24 = ((off >> 2) as u32) & 0x00FF_FFFF;
    if thumb {
        if !is_call {
            return Err(patch_error(
                target_offset,
                insn,
                "ARM branch cannot reach a Thumb target",
            ));
        }
        if insn >> 28 != 0xE {
            return Err(patch_error(
                target_offset,
                insn,
                "conditional call cannot reach a Thumb target",
            ));
        }
        let h = ((off >> 1) & 1) as u32;
        return Ok(0xFA00_0000 | (h << 24) | imm24);
    }
    Ok((insn & 0xFF00_0000) | imm24)
}

/// Thumb-2 BL/BLX. The immediate is S:I1:I2:imm10:imm11 with
/// `J1 = !I1 ^ S` and `J2 = !I2 ^ S`; BLX (ARM target) clears bit 12 of the
/// second halfword and measures from the word-aligned PC.
fn encode_thumb_call(insn: u32, s: u32, p: u32, target_offset: u32) -> Result<u32> {
    let thumb = s & 1 != 0;
    let base = if thumb {
        p.wrapping_add(4)
    } else {
        p.wrapping_add(4) & !3
    };
    let off = (s & !1).wrapping_sub(base) as i32;
    if !(-(1 << 24)..(1 << 24)).contains(&off) {
        return Err(patch_error(
            target_offset,
            insn,
            "Thumb call offset out of range",
        ));
    }
    if !thumb && off & 3 != 0 {
        return Err(patch_error(
            target_offset,
            insn,
            "BLX target is not word aligned",
        ));
    }
    let off = off as u32;
    let sbit = (off >> 24) & 1;
    let j1 = (!(off >> 23) & 1) ^ sbit;
    let j2 = (!(off >> 22) & 1) ^ sbit;
    let imm10 = (off >> 12) & 0x3FF;
    let imm11 = (off >> 1) & 0x7FF;
    let hw1 = 0xF000 | (sbit << 10) | imm10;
    let mut hw2 = (if thumb { 0xD000 } else { 0xC000 }) | (j1 << 13) | (j2 << 11) | imm11;
    if !thumb {
        // BLX encodes imm10L:'0'; the alignment check above makes the low
        // bit zero already.
        hw2 &= !1;
    }
    Ok((hw2 << 16) | hw1)
}
