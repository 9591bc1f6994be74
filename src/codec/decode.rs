//! Stream decoding and pointer resolution.
//!
//! Decoding is pure: it turns a byte stream into logical relocations
//! without touching segment memory. The in-place pointer fixup that entry
//! types 6-9 imply is a separate pass, [`resolve_pointers`], so the codec
//! round-trip can be exercised without writable segment buffers (and the
//! self-verify pass can skip the side effect entirely).

use super::EntryType;
use crate::arch::RelocKind;
use crate::convert::Config;
use crate::index::Relocation;
use crate::segment::SegmentSet;
use crate::{Result, fixup_error, stream_error};
use alloc::format;
use alloc::vec::Vec;

/// Running decode state.
///
/// Types 0 and 1 set every field; delta records (2-9) update only what they
/// encode and inherit the rest. After every record `target_offset` is the
/// target offset of the last relocation that record produced.
#[derive(Debug, Default, Clone)]
pub(crate) struct DecoderState {
    pub(crate) target_segment: u8,
    pub(crate) target_offset: u32,
    pub(crate) symbol_segment: u8,
    pub(crate) symbol_offset: u32,
    pub(crate) kind_primary: RelocKind,
    pub(crate) kind_secondary: RelocKind,
}

impl DecoderState {
    /// The MOVT kind of the current MOVW/MOVT pair state, if the last
    /// symbol-bearing record established one.
    pub(crate) fn mov_pair_kinds(&self) -> Option<(RelocKind, RelocKind)> {
        let (movt, _) = self.kind_primary.mov_pair()?;
        (self.kind_secondary == movt).then_some((self.kind_primary, movt))
    }
}

/// One decoded stream entry.
#[derive(Debug, Clone, Copy)]
pub struct DecodedReloc {
    pub reloc: Relocation,
    /// Entry types 6-9 carry no symbol on the wire: it has to be resolved
    /// from the word at the target site (see [`resolve_pointers`]).
    pub pointer: bool,
}

impl DecodedReloc {
    fn explicit(reloc: Relocation) -> Self {
        Self {
            reloc,
            pointer: false,
        }
    }
}

fn word(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

fn kind_at(code: u32, ty: EntryType, pos: usize) -> Result<RelocKind> {
    RelocKind::from_code(code)
        .map_err(|_| stream_error(ty as u8, pos, format!("unsupported relocation code {code}")))
}

/// Decode a relocation stream into logical relocations.
///
/// Fails on any wire-format violation: an unknown type discriminant, a
/// truncated record, or a delta record that reuses state no prior record
/// established. This format has no compatibility story, so malformed input
/// always means a toolchain mismatch and is never skipped over.
pub fn decode_stream(buf: &[u8], cfg: &Config) -> Result<Vec<DecodedReloc>> {
    let mut out = Vec::new();
    let mut state = DecoderState::default();
    let mut pos = 0usize;
    while pos < buf.len() {
        let nibble = buf[pos] & 0xF;
        let ty = EntryType::from_nibble(nibble)
            .ok_or_else(|| stream_error(nibble, pos, "unknown entry type"))?;
        if buf.len() - pos < ty.size() {
            return Err(stream_error(ty as u8, pos, "truncated record"));
        }
        let w0 = word(buf, pos);
        match ty {
            EntryType::Long => {
                let w1 = word(buf, pos + 4);
                let w2 = word(buf, pos + 8);
                let symbol_segment = ((w0 >> 4) & 0xF) as u8;
                let kind = kind_at((w0 >> 8) & 0xFF, ty, pos)?;
                let target_segment = ((w0 >> 16) & 0xF) as u8;
                let code2 = (w0 >> 20) & 0x7F;
                let append = (w0 >> 27) & 0x1F;
                out.push(DecodedReloc::explicit(Relocation {
                    target_segment,
                    target_offset: w2,
                    symbol_segment,
                    symbol_offset: w1,
                    kind,
                }));
                let mut last_offset = w2;
                let mut secondary = RelocKind::None;
                if code2 != 0 {
                    let kind2 = kind_at(code2, ty, pos)?;
                    last_offset = w2.wrapping_add(append);
                    out.push(DecodedReloc::explicit(Relocation {
                        target_segment,
                        target_offset: last_offset,
                        symbol_segment,
                        symbol_offset: w1,
                        kind: kind2,
                    }));
                    secondary = kind2;
                }
                state = DecoderState {
                    target_segment,
                    target_offset: last_offset,
                    symbol_segment,
                    symbol_offset: w1,
                    kind_primary: kind,
                    kind_secondary: secondary,
                };
            }
            EntryType::Short => {
                let w1 = word(buf, pos + 4);
                let symbol_segment = ((w0 >> 4) & 0xF) as u8;
                let kind = kind_at((w0 >> 8) & 0xFF, ty, pos)?;
                let target_segment = ((w0 >> 16) & 0xF) as u8;
                let target_offset = ((w1 & 0x3FF) << 12) | (w0 >> 20);
                let symbol_offset = w1 >> 10;
                out.push(DecodedReloc::explicit(Relocation {
                    target_segment,
                    target_offset,
                    symbol_segment,
                    symbol_offset,
                    kind,
                }));
                state = DecoderState {
                    target_segment,
                    target_offset,
                    symbol_segment,
                    symbol_offset,
                    kind_primary: kind,
                    kind_secondary: RelocKind::None,
                };
            }
            EntryType::Delta => {
                let w1 = word(buf, pos + 4);
                let symbol_segment = ((w0 >> 4) & 0xF) as u8;
                let kind = kind_at((w0 >> 8) & 0xFF, ty, pos)?;
                let target_offset = state.target_offset.wrapping_add(w0 >> 16);
                out.push(DecodedReloc::explicit(Relocation {
                    target_segment: state.target_segment,
                    target_offset,
                    symbol_segment,
                    symbol_offset: w1,
                    kind,
                }));
                state.target_offset = target_offset;
                state.symbol_segment = symbol_segment;
                state.symbol_offset = w1;
                state.kind_primary = kind;
                state.kind_secondary = RelocKind::None;
            }
            EntryType::MovPairSym => {
                let w1 = word(buf, pos + 4);
                let symbol_segment = ((w0 >> 4) & 0xF) as u8;
                let is_thumb = (w0 >> 8) & 1 != 0;
                let delta = (w0 >> 9) & 0x3FFFF;
                let append = (w0 >> 27) & 0x1F;
                let (movw_kind, movt_kind) = if is_thumb {
                    (RelocKind::ThmMovwAbsNc, RelocKind::ThmMovtAbs)
                } else {
                    (RelocKind::MovwAbsNc, RelocKind::MovtAbs)
                };
                let movw = state.target_offset.wrapping_add(delta);
                let movt = movw.wrapping_add(append);
                for (offset, kind) in [(movw, movw_kind), (movt, movt_kind)] {
                    out.push(DecodedReloc::explicit(Relocation {
                        target_segment: state.target_segment,
                        target_offset: offset,
                        symbol_segment,
                        symbol_offset: w1,
                        kind,
                    }));
                }
                state.target_offset = movt;
                state.symbol_segment = symbol_segment;
                state.symbol_offset = w1;
                state.kind_primary = movw_kind;
                state.kind_secondary = movt_kind;
            }
            EntryType::MovPair => {
                let Some((movw_kind, movt_kind)) = state.mov_pair_kinds() else {
                    return Err(stream_error(
                        ty as u8,
                        pos,
                        "record reuses MOVW/MOVT state but none is current",
                    ));
                };
                let delta = (w0 >> 4) & 0x7F_FFFF;
                let append = (w0 >> 27) & 0x1F;
                let movw = state.target_offset.wrapping_add(delta);
                let movt = movw.wrapping_add(append);
                for (offset, kind) in [(movw, movw_kind), (movt, movt_kind)] {
                    out.push(DecodedReloc::explicit(Relocation {
                        target_segment: state.target_segment,
                        target_offset: offset,
                        symbol_segment: state.symbol_segment,
                        symbol_offset: state.symbol_offset,
                        kind,
                    }));
                }
                state.target_offset = movt;
            }
            EntryType::MovPairX2 => {
                let Some((movw_kind, movt_kind)) = state.mov_pair_kinds() else {
                    return Err(stream_error(
                        ty as u8,
                        pos,
                        "record reuses MOVW/MOVT state but none is current",
                    ));
                };
                let fields = [
                    ((w0 >> 4) & 0x1FF, (w0 >> 13) & 0x1F),
                    ((w0 >> 18) & 0x1FF, (w0 >> 27) & 0x1F),
                ];
                for (delta, append) in fields {
                    let movw = state.target_offset.wrapping_add(delta);
                    let movt = movw.wrapping_add(append);
                    for (offset, kind) in [(movw, movw_kind), (movt, movt_kind)] {
                        out.push(DecodedReloc::explicit(Relocation {
                            target_segment: state.target_segment,
                            target_offset: offset,
                            symbol_segment: state.symbol_segment,
                            symbol_offset: state.symbol_offset,
                            kind,
                        }));
                    }
                    state.target_offset = movt;
                }
            }
            EntryType::Fixup => {
                let delta = (w0 >> 4).wrapping_mul(cfg.align);
                let target_offset = state.target_offset.wrapping_add(delta);
                out.push(DecodedReloc {
                    reloc: pointer_reloc(&state, target_offset),
                    pointer: true,
                });
                state.target_offset = target_offset;
            }
            EntryType::FixupRun4 | EntryType::FixupRun7 | EntryType::FixupRun14 => {
                let width = ty.slot_width();
                let slots = w0 >> 4;
                for i in 0..ty.slot_count() as u32 {
                    let slot = (slots >> (i * width)) & ((1 << width) - 1);
                    if i > 0 && slot == 0 {
                        break;
                    }
                    let target_offset = state
                        .target_offset
                        .wrapping_add(slot.wrapping_mul(cfg.align));
                    out.push(DecodedReloc {
                        reloc: pointer_reloc(&state, target_offset),
                        pointer: true,
                    });
                    state.target_offset = target_offset;
                }
            }
        }
        pos += ty.size();
    }
    Ok(out)
}

fn pointer_reloc(state: &DecoderState, target_offset: u32) -> Relocation {
    Relocation {
        target_segment: state.target_segment,
        target_offset,
        symbol_segment: 0,
        symbol_offset: 0,
        kind: RelocKind::Abs32,
    }
}

/// Resolve the in-place pointers of decoded pointer-class entries.
///
/// For each entry of types 6-9: read the word at the fixup site, find the
/// segment containing it (linear base+size scan), derive the symbol from
/// the containment, and rewrite the word as the load virtual address. A
/// site or pointer outside every loaded segment is fatal.
pub fn resolve_pointers(entries: &mut [DecodedReloc], segments: &mut SegmentSet) -> Result<()> {
    for entry in entries.iter_mut().filter(|e| e.pointer) {
        let reloc = &mut entry.reloc;
        let raw = segments
            .get(reloc.target_segment)?
            .read_u32(reloc.target_offset)?;
        let (symbol_segment, symbol_offset, resolved) = {
            let symbol = segments.locate(raw).ok_or_else(|| {
                fixup_error(
                    reloc.target_segment,
                    reloc.target_offset,
                    raw,
                    "pointer does not fall inside any loaded segment",
                )
            })?;
            let offset = raw - symbol.base();
            (symbol.index(), offset, symbol.vaddr().wrapping_add(offset))
        };
        reloc.symbol_segment = symbol_segment;
        reloc.symbol_offset = symbol_offset;
        segments
            .get_mut(reloc.target_segment)?
            .write_u32(reloc.target_offset, resolved)?;
        #[cfg(feature = "log")]
        log::trace!(
            "fixup at segment {} offset {:#x}: {raw:#010x} -> {resolved:#010x}",
            reloc.target_segment,
            reloc.target_offset
        );
    }
    Ok(())
}
