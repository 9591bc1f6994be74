//! Per-segment conversion pipeline.
//!
//! One conversion pass owns one [`RelocationIndex`], decodes a segment's
//! input stream into it, optionally applies the relocations in place,
//! re-encodes, and verifies the round trip by checksum. The "text" and
//! "data" streams of a module are two independent sequential passes; each
//! index lives exactly as long as its pass.

use crate::arch::{self, RelocKind};
use crate::codec::{self, decode_stream, resolve_pointers};
use crate::index::RelocationIndex;
use crate::segment::SegmentSet;
use crate::{Error, Result};
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Platform behavior switches. Compile-time configuration in the
    /// original toolchain; plain runtime values here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConvertFlags: u32 {
        /// Patch every indexed relocation into the segment buffers before
        /// encoding (the "apply now" pass).
        const PRE_RELOCATE = 1 << 0;
        /// Extract pointer-class relocations from the symbol groups and
        /// re-emit them as batched fixup runs (entry types 6-9).
        const BATCH_POINTERS = 1 << 1;
        /// Sort the extracted pointer batch by target address.
        const SORT_BATCH = 1 << 2;
        /// Re-decode the encoded output and compare checksums.
        const VERIFY = 1 << 3;
    }
}

/// Codec configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub flags: ConvertFlags,
    /// Alignment unit of the fixup deltas in entry types 6-9. Pointer
    /// tables are word-aligned on this platform, so the default is 4.
    pub align: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flags: ConvertFlags::BATCH_POINTERS | ConvertFlags::SORT_BATCH | ConvertFlags::VERIFY,
            align: 4,
        }
    }
}

/// An encoded per-segment relocation stream and its checksum.
#[derive(Debug)]
pub struct EncodedStream {
    pub data: Vec<u8>,
    pub checksum: u32,
}

/// Decode `stream`, resolve its pointer fixups against `segments`, and
/// register every relocation into `index`. The index's target-segment
/// filter drops entries belonging to other segments, which is how a merged
/// multi-segment stream is split into per-segment passes.
pub fn register(
    index: &mut RelocationIndex,
    stream: &[u8],
    segments: &mut SegmentSet,
    cfg: &Config,
) -> Result<()> {
    let mut entries = decode_stream(stream, cfg)?;
    resolve_pointers(&mut entries, segments)?;
    for entry in &entries {
        index.insert(entry.reloc);
    }
    #[cfg(feature = "log")]
    log::debug!(
        "segment {}: registered {} stream entries, kept {}",
        index.target_segment(),
        index.registered(),
        index.len()
    );
    Ok(())
}

/// Patch every indexed relocation directly into the loaded segments.
pub fn apply(index: &RelocationIndex, segments: &mut SegmentSet) -> Result<()> {
    for group in index.groups() {
        let symbol_vaddr = segments.get(group.symbol_segment())?.vaddr();
        for r in group.relocs() {
            let target = segments.get(r.target_segment)?;
            let target_vaddr = target.vaddr();
            let insn = target.read_u32(r.target_offset)?;
            let patched = arch::patch(
                insn,
                r.kind,
                r.target_offset,
                symbol_vaddr,
                r.symbol_offset,
                target_vaddr,
            )?;
            segments
                .get_mut(r.target_segment)?
                .write_u32(r.target_offset, patched)?;
        }
    }
    #[cfg(feature = "log")]
    log::debug!("applied {} relocations in place", index.len());
    Ok(())
}

/// Re-decode `stream` and compare its checksum against `expected`.
///
/// This is the codec's only self-check and a mismatch is always fatal: it
/// means the encoder emitted something that does not represent the same
/// relocations it was given.
pub fn verify(stream: &[u8], expected: u32, cfg: &Config) -> Result<()> {
    let entries = decode_stream(stream, cfg)?;
    let actual = entries
        .iter()
        .filter(|e| !matches!(e.reloc.kind, RelocKind::None | RelocKind::V4bx))
        .fold(0u32, |sum, e| sum.wrapping_add(e.reloc.checksum()));
    if actual != expected {
        #[cfg(feature = "log")]
        log::error!("round-trip checksum mismatch: expected {expected:#010x}, got {actual:#010x}");
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Convert one segment's relocation stream into its compact re-encoding.
pub fn convert_segment(
    stream: &[u8],
    target_segment: u8,
    segments: &mut SegmentSet,
    cfg: &Config,
) -> Result<EncodedStream> {
    #[cfg(feature = "log")]
    log::info!(
        "converting relocation stream for segment {target_segment} ({} bytes)",
        stream.len()
    );
    let mut index = RelocationIndex::new(target_segment);
    register(&mut index, stream, segments, cfg)?;
    if cfg.flags.contains(ConvertFlags::PRE_RELOCATE) {
        apply(&index, segments)?;
    }
    let checksum = index.checksum();
    let data = codec::encode(&mut index, cfg)?;
    if cfg.flags.contains(ConvertFlags::VERIFY) {
        verify(&data, checksum, cfg)?;
    }
    #[cfg(feature = "log")]
    log::info!(
        "segment {target_segment}: {} -> {} bytes, checksum {checksum:#010x}",
        stream.len(),
        data.len()
    );
    Ok(EncodedStream { data, checksum })
}
