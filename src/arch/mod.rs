//! Architecture-specific relocation support.
//!
//! The platform's modules are ARM32 only; the architecture split keeps the
//! instruction-level patching separate from the format-level codec.

pub mod arm;

pub use arm::{EM_ARCH, RelocKind, patch};
