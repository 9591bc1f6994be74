//! Greedy stream encoding.
//!
//! The encoder walks the index per symbol group and emits, at every
//! position, the most compact entry type whose decode would reconstruct the
//! same relocations; on a field-width overflow it falls through to the next
//! wider form, down to the full type-0 record, which always fits. The
//! priority and fallback order are fixed, so the emitted bytes are a
//! deterministic function of the index contents; downstream consumers
//! checksum the round trip.
//!
//! Pointer-class relocations (`Abs32`/`Target1`) can optionally be pulled
//! out of the groups first and re-emitted at the end of the stream as
//! packed fixup runs (types 6-9), which is where the bulk of a module's
//! relocations usually end up.

use super::EntryType;
use super::decode::DecoderState;
use super::writer::RelocWriter;
use crate::arch::RelocKind;
use crate::convert::{Config, ConvertFlags};
use crate::index::{Relocation, RelocationIndex, SymbolGroup};
use crate::Result;
use alloc::vec::Vec;

/// Encode the index contents into a compact relocation stream.
///
/// Mutates the index: pointer-class relocations are partitioned out when
/// batching is enabled, and the remaining groups are sorted into the
/// canonical visitation order.
pub fn encode(index: &mut RelocationIndex, cfg: &Config) -> Result<Vec<u8>> {
    let mut writer = RelocWriter::new();
    let mut state = DecoderState::default();
    let batch = if cfg.flags.contains(ConvertFlags::BATCH_POINTERS) {
        let mut batch = index.partition_pointer_class(RelocKind::Abs32);
        batch.extend(index.partition_pointer_class(RelocKind::Target1));
        if cfg.flags.contains(ConvertFlags::SORT_BATCH) {
            batch.sort_by_key(|r| r.target_offset);
        }
        batch
    } else {
        Vec::new()
    };
    index.sort_by_target();
    for group in index.groups() {
        encode_group(&mut writer, &mut state, group)?;
    }
    encode_batch(&mut writer, &mut state, &batch, cfg)?;
    #[cfg(feature = "log")]
    log::debug!(
        "encoded {} bytes, records by entry type {:?}",
        writer.len(),
        writer.counts()
    );
    Ok(writer.into_bytes())
}

/// A MOVW/MOVT pair starting at `rels[i]`.
struct MovPairAt {
    append: u32,
    thumb: bool,
}

fn mov_pair_at(rels: &[Relocation], i: usize) -> Option<MovPairAt> {
    let movw = rels.get(i)?;
    let movt = rels.get(i + 1)?;
    let (movt_kind, thumb) = movw.kind.mov_pair()?;
    if movt.kind != movt_kind {
        return None;
    }
    let append = movt.target_offset.checked_sub(movw.target_offset)?;
    (append < 32).then_some(MovPairAt { append, thumb })
}

fn set_absolute(state: &mut DecoderState, r: &Relocation, secondary: RelocKind, last_offset: u32) {
    *state = DecoderState {
        target_segment: r.target_segment,
        target_offset: last_offset,
        symbol_segment: r.symbol_segment,
        symbol_offset: r.symbol_offset,
        kind_primary: r.kind,
        kind_secondary: secondary,
    };
}

fn encode_group(
    writer: &mut RelocWriter,
    state: &mut DecoderState,
    group: &SymbolGroup,
) -> Result<()> {
    let rels = group.relocs();
    let mut i = 0;
    while i < rels.len() {
        let cur = &rels[i];
        // Types 2-5 inherit the running target segment; until an absolute
        // record has pinned it, only types 0/1 are decodable.
        let seg_ok = state.target_segment == cur.target_segment;
        if let Some(pair) = mov_pair_at(rels, i) {
            let reuse_ok = seg_ok
                && state.symbol_segment == cur.symbol_segment
                && state.symbol_offset == cur.symbol_offset
                && state
                    .mov_pair_kinds()
                    .is_some_and(|(movw, _)| movw == cur.kind);
            if reuse_ok {
                if let Some(pair2) = mov_pair_at(rels, i + 2) {
                    if let (Some(d1), Some(d2)) = (
                        cur.target_offset.checked_sub(state.target_offset),
                        rels[i + 2]
                            .target_offset
                            .checked_sub(rels[i + 1].target_offset),
                    ) {
                        if writer.mov_pair_x2(d1, pair.append, d2, pair2.append).is_ok() {
                            state.target_offset = rels[i + 3].target_offset;
                            i += 4;
                            continue;
                        }
                    }
                }
                if let Some(d) = cur.target_offset.checked_sub(state.target_offset) {
                    if writer.mov_pair(d, pair.append).is_ok() {
                        state.target_offset = rels[i + 1].target_offset;
                        i += 2;
                        continue;
                    }
                }
            }
            if seg_ok
                && let Some(d) = cur.target_offset.checked_sub(state.target_offset)
                && writer
                    .mov_pair_sym(
                        cur.symbol_segment,
                        pair.thumb,
                        d,
                        pair.append,
                        cur.symbol_offset,
                    )
                    .is_ok()
            {
                state.symbol_segment = cur.symbol_segment;
                state.symbol_offset = cur.symbol_offset;
                state.kind_primary = cur.kind;
                state.kind_secondary = rels[i + 1].kind;
                state.target_offset = rels[i + 1].target_offset;
                i += 2;
                continue;
            }
        }
        // Any two close relocations ride one full-width record.
        if let Some(next) = rels.get(i + 1) {
            let append = next.target_offset.wrapping_sub(cur.target_offset);
            if append < 32 {
                writer.long_entry(
                    cur.symbol_segment,
                    cur.kind.code(),
                    cur.target_segment,
                    next.kind.code(),
                    append,
                    cur.symbol_offset,
                    cur.target_offset,
                )?;
                set_absolute(state, cur, next.kind, next.target_offset);
                i += 2;
                continue;
            }
        }
        encode_single(writer, state, cur)?;
        i += 1;
    }
    Ok(())
}

fn encode_single(
    writer: &mut RelocWriter,
    state: &mut DecoderState,
    r: &Relocation,
) -> Result<()> {
    if state.target_segment == r.target_segment
        && let Some(d) = r.target_offset.checked_sub(state.target_offset)
        && writer
            .delta_entry(r.symbol_segment, r.kind.code(), d, r.symbol_offset)
            .is_ok()
    {
        state.target_offset = r.target_offset;
        state.symbol_segment = r.symbol_segment;
        state.symbol_offset = r.symbol_offset;
        state.kind_primary = r.kind;
        state.kind_secondary = RelocKind::None;
        return Ok(());
    }
    encode_absolute(writer, state, r)
}

fn encode_absolute(
    writer: &mut RelocWriter,
    state: &mut DecoderState,
    r: &Relocation,
) -> Result<()> {
    if writer
        .short_entry(
            r.symbol_segment,
            r.kind.code(),
            r.target_segment,
            r.target_offset,
            r.symbol_offset,
        )
        .is_ok()
    {
        set_absolute(state, r, RelocKind::None, r.target_offset);
        return Ok(());
    }
    writer.long_entry(
        r.symbol_segment,
        r.kind.code(),
        r.target_segment,
        0,
        0,
        r.symbol_offset,
        r.target_offset,
    )?;
    set_absolute(state, r, RelocKind::None, r.target_offset);
    Ok(())
}

/// Delta between two fixup sites in alignment units, if representable.
fn slot_delta(from: u32, to: u32, align: u32) -> Option<u32> {
    let delta = to.checked_sub(from)?;
    (align != 0 && delta % align == 0).then(|| delta / align)
}

fn encode_batch(
    writer: &mut RelocWriter,
    state: &mut DecoderState,
    batch: &[Relocation],
    cfg: &Config,
) -> Result<()> {
    let mut i = 0;
    while i < batch.len() {
        let cur = &batch[i];
        if state.target_segment == cur.target_segment
            && let Some(first) = slot_delta(state.target_offset, cur.target_offset, cfg.align)
        {
            // Narrowest slot width that holds the lead delta, then pack
            // followers while they share it and slots remain.
            let mut emitted = false;
            for ty in [
                EntryType::FixupRun14,
                EntryType::FixupRun7,
                EntryType::FixupRun4,
            ] {
                let width = ty.slot_width();
                if first >> width != 0 {
                    continue;
                }
                let mut slots = Vec::with_capacity(ty.slot_count());
                slots.push(first);
                let mut prev = cur.target_offset;
                let mut j = i + 1;
                while slots.len() < ty.slot_count() && j < batch.len() {
                    match slot_delta(prev, batch[j].target_offset, cfg.align) {
                        Some(d) if d != 0 && d >> width == 0 => {
                            slots.push(d);
                            prev = batch[j].target_offset;
                            j += 1;
                        }
                        _ => break,
                    }
                }
                writer.fixup_run(ty, &slots)?;
                state.target_offset = prev;
                i = j;
                emitted = true;
                break;
            }
            if emitted {
                continue;
            }
            if writer.fixup(first).is_ok() {
                state.target_offset = cur.target_offset;
                i += 1;
                continue;
            }
        }
        // Backward, unaligned, or out-of-range sites keep their explicit
        // absolute form.
        encode_absolute(writer, state, cur)?;
        i += 1;
    }
    Ok(())
}
