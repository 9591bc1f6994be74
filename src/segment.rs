//! Loaded segment buffers.
//!
//! The codec never reads the container format. Collaborators hand it the
//! loaded segments as byte buffers, each tagged with the platform segment
//! index, the link-time base address the module was built against, and the
//! virtual address it is (or will be) loaded at. Loaders that do not rebase
//! pass the same value for both.

use crate::{Result, segment_error};
use alloc::vec::Vec;

/// One loaded segment.
#[derive(Debug)]
pub struct Segment {
    index: u8,
    base: u32,
    vaddr: u32,
    data: Vec<u8>,
}

impl Segment {
    /// A segment mapped at its link-time address.
    pub fn new(index: u8, base: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            base,
            vaddr: base,
            data,
        }
    }

    /// A segment rebased to a different load address.
    pub fn with_vaddr(index: u8, base: u32, vaddr: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            base,
            vaddr,
            data,
        }
    }

    /// The platform segment index (0..16).
    pub fn index(&self) -> u8 {
        self.index
    }

    /// The link-time base address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The load virtual address.
    pub fn vaddr(&self) -> u32 {
        self.vaddr
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the link-time address `addr` falls inside this segment.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && ((addr - self.base) as usize) < self.data.len()
    }

    /// Read the 32-bit word at `offset`.
    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let bytes = self
            .data
            .get(offset as usize..offset as usize + 4)
            .ok_or_else(|| {
                segment_error(self.index, offset, "relocation site outside segment memory")
            })?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Write the 32-bit word at `offset`.
    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        let bytes = self
            .data
            .get_mut(offset as usize..offset as usize + 4)
            .ok_or_else(|| {
                segment_error(self.index, offset, "relocation site outside segment memory")
            })?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// The set of segments loaded for one module.
#[derive(Debug, Default)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// The segment tagged with the platform index `index`.
    pub fn get(&self, index: u8) -> Result<&Segment> {
        self.segments
            .iter()
            .find(|s| s.index == index)
            .ok_or_else(|| segment_error(index, 0, "no loaded segment with this index"))
    }

    pub fn get_mut(&mut self, index: u8) -> Result<&mut Segment> {
        self.segments
            .iter_mut()
            .find(|s| s.index == index)
            .ok_or_else(|| segment_error(index, 0, "no loaded segment with this index"))
    }

    /// Locate the segment containing the link-time address `addr`.
    ///
    /// A linear scan; module segment counts are single digits.
    pub fn locate(&self, addr: u32) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(addr))
    }
}
