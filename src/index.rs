//! In-memory relocation index.
//!
//! Decoded relocations are grouped by the symbol they relocate against. A
//! "symbol" at this stage is an anonymous `(segment, offset)` pair: the
//! platform's module format resolves names before the relocation streams
//! are built. The encoder walks the groups in target-address order, so the
//! index supports the sort and partition passes it needs.
//!
//! One index serves one output segment pass; the "text" and "data" streams
//! of a module are two independent index lifetimes.

use crate::arch::RelocKind;
use alloc::vec::Vec;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

/// One logical relocation.
///
/// `target_*` is where the patch is applied; `symbol_*` is the value the
/// patch is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub target_segment: u8,
    pub target_offset: u32,
    pub symbol_segment: u8,
    pub symbol_offset: u32,
    pub kind: RelocKind,
}

impl Relocation {
    /// This relocation's contribution to the round-trip checksum.
    ///
    /// Pointer-class entries lose their symbol on the wire (it lives in the
    /// fixed-up memory word instead), so only the MOVW/MOVT family folds
    /// symbol data in.
    pub(crate) fn checksum(&self) -> u32 {
        let mut sum = self
            .target_offset
            .wrapping_add(u32::from(self.target_segment));
        if self.kind.is_mov_family() {
            sum = sum
                .wrapping_add(self.symbol_offset)
                .wrapping_add(u32::from(self.symbol_segment));
        }
        sum
    }
}

/// The relocations sharing one symbol.
#[derive(Debug)]
pub struct SymbolGroup {
    symbol_segment: u8,
    symbol_offset: u32,
    relocs: Vec<Relocation>,
}

impl SymbolGroup {
    pub fn symbol_segment(&self) -> u8 {
        self.symbol_segment
    }

    pub fn symbol_offset(&self) -> u32 {
        self.symbol_offset
    }

    pub fn relocs(&self) -> &[Relocation] {
        &self.relocs
    }
}

/// Index over one output segment's relocations.
#[derive(Debug)]
pub struct RelocationIndex {
    target_segment: u8,
    groups: Vec<SymbolGroup>,
    by_symbol: HashMap<(u8, u32), usize>,
    registered: u64,
}

impl RelocationIndex {
    /// An empty index accepting relocations targeting `target_segment`.
    pub fn new(target_segment: u8) -> Self {
        Self {
            target_segment,
            groups: Vec::new(),
            by_symbol: HashMap::new(),
            registered: 0,
        }
    }

    pub fn target_segment(&self) -> u8 {
        self.target_segment
    }

    /// Number of stream entries offered to the index, kept or not.
    pub fn registered(&self) -> u64 {
        self.registered
    }

    /// Total number of relocations held.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.relocs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[SymbolGroup] {
        &self.groups
    }

    /// Insert one relocation.
    ///
    /// `R_ARM_NONE` and `R_ARM_V4BX` never enter the index, and neither does
    /// anything targeting a segment other than this index's: merged
    /// multi-segment streams are split into per-segment passes by exactly
    /// this filter.
    pub fn insert(&mut self, reloc: Relocation) {
        self.registered += 1;
        if matches!(reloc.kind, RelocKind::None | RelocKind::V4bx) {
            #[cfg(feature = "log")]
            log::trace!(
                "skipping {} at segment {} offset {:#x}",
                reloc.kind.name(),
                reloc.target_segment,
                reloc.target_offset
            );
            return;
        }
        if reloc.target_segment != self.target_segment {
            #[cfg(feature = "log")]
            log::trace!(
                "segment filter {} drops relocation targeting segment {}",
                self.target_segment,
                reloc.target_segment
            );
            return;
        }
        let key = (reloc.symbol_segment, reloc.symbol_offset);
        let idx = match self.by_symbol.entry(key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let idx = self.groups.len();
                self.groups.push(SymbolGroup {
                    symbol_segment: reloc.symbol_segment,
                    symbol_offset: reloc.symbol_offset,
                    relocs: Vec::new(),
                });
                entry.insert(idx);
                idx
            }
        };
        self.groups[idx].relocs.push(reloc);
    }

    /// Stable-sort every group by target offset, then the groups by their
    /// head relocation's target offset. The encoder's visitation order (and
    /// with it the emitted byte stream) is fixed by this pass.
    pub fn sort_by_target(&mut self) {
        for group in &mut self.groups {
            group.relocs.sort_by_key(|r| r.target_offset);
        }
        self.groups
            .sort_by_key(|g| g.relocs.first().map_or(u32::MAX, |r| r.target_offset));
        self.rebuild_map();
    }

    /// Remove every relocation of `kind` from every group and return them as
    /// one list: symbols outside segment 1 first, then segment-1 symbols
    /// (the platform keeps segment-1 pointers together for placement).
    /// Groups left empty are dropped.
    pub fn partition_pointer_class(&mut self, kind: RelocKind) -> Vec<Relocation> {
        debug_assert!(kind.is_pointer());
        let mut others = Vec::new();
        let mut seg1 = Vec::new();
        for group in &mut self.groups {
            group.relocs.retain(|r| {
                if r.kind == kind {
                    if r.symbol_segment == 1 {
                        seg1.push(*r);
                    } else {
                        others.push(*r);
                    }
                    false
                } else {
                    true
                }
            });
        }
        self.groups.retain(|g| !g.relocs.is_empty());
        self.rebuild_map();
        others.extend(seg1);
        others
    }

    /// The additive round-trip checksum over all live relocations.
    pub fn checksum(&self) -> u32 {
        self.groups
            .iter()
            .flat_map(|g| g.relocs.iter())
            .fold(0u32, |sum, r| sum.wrapping_add(r.checksum()))
    }

    /// Drop all groups. The registered-entries counter survives, being a
    /// diagnostic of the whole pass.
    pub fn clear(&mut self) {
        self.groups.clear();
        self.by_symbol.clear();
    }

    fn rebuild_map(&mut self) {
        self.by_symbol.clear();
        for (idx, group) in self.groups.iter().enumerate() {
            self.by_symbol
                .insert((group.symbol_segment, group.symbol_offset), idx);
        }
    }
}
