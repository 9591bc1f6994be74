//! # velf-reloc
//!
//! **velf-reloc** is the relocation codec of a toolchain that converts ARM
//! ELF binaries into the VELF executable format used by a fixed-purpose
//! embedded platform. It translates between a linear stream of logical ARM
//! relocations and the platform's compact wire encoding: ten variable-width
//! entry types (0-9) that delta-encode target offsets, fold MOVW/MOVT pairs
//! into single words, and batch pointer fixups into packed sub-entry runs.
//!
//! ## Core pieces
//!
//! * **[`index`]**: the in-memory [`RelocationIndex`](index::RelocationIndex),
//!   grouping relocations by the `(segment, offset)` symbol they resolve
//!   against.
//! * **[`codec`]**: the wire format, with a validating entry writer, the
//!   stream decoder, and the greedy encoder.
//! * **[`arch`]**: ARM/Thumb instruction patching for every relocation kind
//!   the platform's object files use.
//! * **[`convert`]**: the per-segment pipeline tying the pieces together,
//!   including the round-trip checksum self-check.
//!
//! The container format around the streams (ELF on the way in, the VELF
//! wrapper on the way out) is deliberately out of scope: segments arrive
//! here as byte buffers tagged with a segment index and virtual addresses.
//!
//! ## Quick start
//!
//! ```rust
//! use velf_reloc::{Config, RelocKind};
//! use velf_reloc::index::{Relocation, RelocationIndex};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut index = RelocationIndex::new(0);
//!     index.insert(Relocation {
//!         target_segment: 0,
//!         target_offset: 0x100,
//!         symbol_segment: 1,
//!         symbol_offset: 0x40,
//!         kind: RelocKind::Rel32,
//!     });
//!     let stream = velf_reloc::codec::encode(&mut index, &Config::default())?;
//!     assert!(!stream.is_empty());
//!     Ok(())
//! }
//! ```
#![no_std]
#![warn(
    clippy::unnecessary_wraps,
    clippy::unnecessary_lazy_evaluations,
    clippy::collapsible_if,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::manual_assert,
    clippy::needless_question_mark,
    clippy::needless_return,
    clippy::redundant_clone,
    clippy::redundant_else,
    clippy::redundant_static_lifetimes
)]
#![allow(clippy::len_without_is_empty)]
extern crate alloc;

pub mod arch;
pub mod codec;
pub mod convert;
mod error;
pub mod index;
pub mod segment;

pub(crate) use error::{fixup_error, overflow_error, patch_error, segment_error, stream_error};

pub use arch::RelocKind;
pub use convert::{Config, ConvertFlags, EncodedStream, convert_segment};
pub use error::Error;

/// A type alias for `Result`s returned by `velf_reloc` functions.
pub type Result<T> = core::result::Result<T, Error>;
