//! Fixed container header
//!
//! The header is a base struct every version shares plus an extension
//! struct gated on the version word. Both are written as little-endian
//! 32-bit words and zero padded up to the trailing crc word.

use std::io::{Cursor, Read};

use super::{carries_extension, CRC_RESERVED, HEADER_LENGTH, HEADER_VERSION, WORD};
use crate::error::{KernelPackError, Result};

/// Words shared by every header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderBase {
    pub version: u32,
    pub magic: u32,
    pub op_para_size: u32,
    pub core_type: u32,
    pub kernel_num: u32,
    /// Offset of the kernel-name table (always 0).
    pub kernel_name_offset: u32,
    pub compile_info_offset: u32,
    pub binary_offset: u32,
}

/// Words appended after the base on versions that carry them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderExtension {
    pub intercore_sync: u32,
    pub task_ration: u32,
}

/// Complete fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedHeader {
    pub base: HeaderBase,
    pub extension: Option<HeaderExtension>,
    pub crc: u32,
}

impl PackedHeader {
    pub fn new(base: HeaderBase, extension: HeaderExtension) -> Self {
        Self {
            base,
            extension: carries_extension(base.version).then_some(extension),
            crc: CRC_RESERVED,
        }
    }

    /// Append exactly [`HEADER_LENGTH`] bytes to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let b = &self.base;
        for word in [
            b.version,
            b.magic,
            b.op_para_size,
            b.core_type,
            b.kernel_num,
            b.kernel_name_offset,
            b.compile_info_offset,
            b.binary_offset,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        if let Some(ext) = &self.extension {
            out.extend_from_slice(&ext.intercore_sync.to_le_bytes());
            out.extend_from_slice(&ext.task_ration.to_le_bytes());
        }
        out.resize(start + HEADER_LENGTH - WORD, 0);
        out.extend_from_slice(&self.crc.to_le_bytes());
    }

    /// Read the fixed header from the start of `bytes`.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(KernelPackError::Truncated {
                offset: 0,
                needed: HEADER_LENGTH,
                len: bytes.len(),
            });
        }
        let mut cursor = Cursor::new(&bytes[..HEADER_LENGTH]);

        let version = read_u32_le(&mut cursor)?;
        if version > HEADER_VERSION {
            return Err(KernelPackError::UnsupportedVersion(version));
        }
        let base = HeaderBase {
            version,
            magic: read_u32_le(&mut cursor)?,
            op_para_size: read_u32_le(&mut cursor)?,
            core_type: read_u32_le(&mut cursor)?,
            kernel_num: read_u32_le(&mut cursor)?,
            kernel_name_offset: read_u32_le(&mut cursor)?,
            compile_info_offset: read_u32_le(&mut cursor)?,
            binary_offset: read_u32_le(&mut cursor)?,
        };
        let extension = if carries_extension(version) {
            Some(HeaderExtension {
                intercore_sync: read_u32_le(&mut cursor)?,
                task_ration: read_u32_le(&mut cursor)?,
            })
        } else {
            None
        };

        cursor.set_position((HEADER_LENGTH - WORD) as u64);
        let crc = read_u32_le(&mut cursor)?;

        Ok(Self {
            base,
            extension,
            crc,
        })
    }
}

pub(crate) fn read_u32_le(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let offset = cursor.position() as usize;
    let mut buf = [0u8; WORD];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| KernelPackError::Truncated {
            offset,
            needed: WORD,
            len: cursor.get_ref().len(),
        })?;
    Ok(u32::from_le_bytes(buf))
}
