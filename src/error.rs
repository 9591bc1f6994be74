//! Error types for the relocation codec.
//!
//! Every failure carries enough context to identify the offending segment,
//! entry type, or stream offset; nothing is silently skipped. The
//! constructor helpers below build the contextual messages and emit the
//! matching log record at the failure site.

use alloc::format;
use alloc::string::String;
use core::fmt;

/// Errors produced by the relocation codec.
#[derive(Debug)]
pub enum Error {
    /// The relocation stream (or a fixup site it names) violates the wire
    /// format. There is no forward/backward compatibility in this format, so
    /// malformed data always means a toolchain mismatch.
    Malformed { msg: String },
    /// A field value does not fit the bit width of the entry layout it was
    /// offered to. Recoverable inside the encoder, which falls back to a
    /// wider layout; fatal anywhere else.
    Overflow { msg: String },
    /// Re-decoding freshly encoded output did not reproduce the checksum of
    /// the input. Always fatal: the output does not represent the same
    /// relocations.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A relocation code outside the platform's closed kind set.
    UnsupportedReloc { code: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Malformed { msg } => write!(f, "malformed relocation data: {msg}"),
            Error::Overflow { msg } => write!(f, "field overflow: {msg}"),
            Error::ChecksumMismatch { expected, actual } => write!(
                f,
                "relocation checksum mismatch: expected {expected:#010x}, re-decoded {actual:#010x}"
            ),
            Error::UnsupportedReloc { code } => {
                write!(f, "unsupported relocation code {code}")
            }
        }
    }
}

impl core::error::Error for Error {}

/// Build a wire-format error for a record in the relocation stream.
pub(crate) fn stream_error(entry_type: u8, pos: usize, msg: impl AsRef<str>) -> Error {
    let msg = format!(
        "{} (entry type {entry_type} at stream byte {pos})",
        msg.as_ref()
    );
    #[cfg(feature = "log")]
    log::error!("relocation stream: {msg}");
    Error::Malformed { msg }
}

/// Build an error for an access outside a loaded segment.
pub(crate) fn segment_error(segment: u8, offset: u32, msg: impl AsRef<str>) -> Error {
    let msg = format!("{} (segment {segment}, offset {offset:#x})", msg.as_ref());
    #[cfg(feature = "log")]
    log::error!("segment access: {msg}");
    Error::Malformed { msg }
}

/// Build an error for a pointer fixup that cannot be resolved.
pub(crate) fn fixup_error(segment: u8, offset: u32, value: u32, msg: impl AsRef<str>) -> Error {
    let msg = format!(
        "{} (pointer {value:#010x} at segment {segment}, offset {offset:#x})",
        msg.as_ref()
    );
    #[cfg(feature = "log")]
    log::error!("pointer fixup: {msg}");
    Error::Malformed { msg }
}

/// Build an error for an instruction the patcher refuses to touch.
pub(crate) fn patch_error(offset: u32, insn: u32, msg: impl AsRef<str>) -> Error {
    let msg = format!(
        "{} (instruction {insn:#010x} at target offset {offset:#x})",
        msg.as_ref()
    );
    #[cfg(feature = "log")]
    log::error!("instruction patch: {msg}");
    Error::Malformed { msg }
}

/// Build a field-width violation for the entry writer.
pub(crate) fn overflow_error(field: &'static str, value: u32, bits: u32) -> Error {
    Error::Overflow {
        msg: format!("{field} value {value:#x} does not fit {bits} bits"),
    }
}
