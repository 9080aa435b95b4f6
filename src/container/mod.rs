//! Packed kernel container
//!
//! Binary format that wraps a linked device object together with the
//! metadata the runtime registry needs to load it:
//!
//! ```text
//! [128-byte header][kernel-name table][compile-info table][u32 size][object]
//! ```
//!
//! Header offsets are counted from the end of the fixed header, not from
//! the start of the blob.

pub mod codec;
pub mod header;

pub use codec::{pack, padded_len, unpack, UnpackedArtifact};
pub use header::{HeaderBase, HeaderExtension, PackedHeader};

/// Size of the fixed header, crc word included.
pub const HEADER_LENGTH: usize = 128;

/// Width of every length and header field.
pub const WORD: usize = 4;

/// Header version written by this crate.
pub const HEADER_VERSION: u32 = 0;

/// Whether headers of `version` carry the [`HeaderExtension`] words.
pub fn carries_extension(version: u32) -> bool {
    matches!(version, 0)
}

/// Reserved checksum value. Written as-is, never verified.
pub const CRC_RESERVED: u32 = 0;
