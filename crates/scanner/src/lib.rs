//! # The Scanner: Mach-O Header & Load Command Walk
//!
//! **Role**: Interprets a mapped 64-bit Mach-O image and locates its
//! `LC_ENCRYPTION_INFO_64` directive.
//!
//! **Core Types**:
//! - `BinaryImage`: validated header plus a borrowed view of the image bytes.
//! - `LoadDirective`: one `{kind, size}` record found during the walk.
//! - `FormatError`: every way an image can fail validation.
//!
//! **Design**:
//! - Fields are read through explicit little-endian, bounds-checked readers;
//!   nothing is reinterpreted through a pointer cast.
//! - Directives are walked strictly in storage order, advancing by each
//!   directive's declared size. A size that would run past the image ends
//!   the walk with an error instead of reading out of bounds.

pub mod directive;
pub mod image;

pub use directive::{Directives, LoadDirective};
pub use image::{BinaryImage, MachHeader};

/// Errors raised while validating or walking an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("image is {len} bytes, too short for a 64-bit Mach-O header")]
    Truncated { len: usize },
    #[error("bad magic 0x{found:08x} (expected a thin 64-bit Mach-O, 0xfeedfacf)")]
    BadMagic { found: u32 },
    #[error(
        "unsupported architecture: cputype 0x{cpu_type:08x}, subtype 0x{cpu_subtype:08x} (only arm64/all is supported)"
    )]
    UnsupportedCpu { cpu_type: u32, cpu_subtype: u32 },
    #[error("load command #{index} at offset {offset} does not fit in the image")]
    DirectiveHeaderOverrun { index: u32, offset: usize },
    #[error("load command #{index} at offset {offset} declares {size} bytes, past the end of the image ({len} bytes)")]
    DirectiveOverrun {
        index: u32,
        offset: usize,
        size: u32,
        len: usize,
    },
    #[error("load command #{index} at offset {offset} declares {size} bytes, below the minimum of {min}")]
    DirectiveTooSmall {
        index: u32,
        offset: usize,
        size: u32,
        min: usize,
    },
    #[error("encrypted range [{offset}, {offset}+{size}) lies outside the image ({len} bytes)")]
    CryptRangeOutOfBounds { offset: u32, size: u32, len: usize },
}
