//! Container encoding and decoding

use std::io::{Cursor, Read};

use super::header::read_u32_le;
use super::{HeaderBase, HeaderExtension, PackedHeader, HEADER_LENGTH, HEADER_VERSION, WORD};
use crate::descriptor::{CoreType, KernelDescriptor, Magic, TaskRation};
use crate::error::{KernelPackError, Result};

/// Length of `len` bytes of text after NUL padding.
///
/// Always leaves at least one NUL so readers can stop at the terminator.
pub fn padded_len(len: usize) -> usize {
    (len / WORD + 1) * WORD
}

fn to_word(field: &'static str, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| KernelPackError::FieldTooLarge { field, len })
}

/// Pack a descriptor and the linked object into a container blob.
///
/// Deterministic: the same inputs always produce the same bytes.
pub fn pack(descriptor: &KernelDescriptor, object: &[u8]) -> Result<Vec<u8>> {
    if descriptor.kernel_list.is_empty() {
        return Err(KernelPackError::InconsistentContainer(
            "kernel list is empty".to_string(),
        ));
    }

    let compile_info = descriptor.compile_info_text();
    let compile_info_padded = padded_len(compile_info.len());

    let names_len: usize = descriptor
        .kernel_list
        .iter()
        .map(|name| WORD + name.len())
        .sum();
    let binary_offset = names_len + WORD + compile_info_padded;

    let base = HeaderBase {
        version: HEADER_VERSION,
        magic: descriptor.magic.code(),
        op_para_size: descriptor.op_para_size,
        core_type: descriptor.core_type.code(),
        kernel_num: to_word("kernel list", descriptor.kernel_list.len())?,
        kernel_name_offset: 0,
        compile_info_offset: to_word("kernel name table", names_len)?,
        binary_offset: to_word("variable section", binary_offset)?,
    };
    let extension = HeaderExtension {
        intercore_sync: u32::from(descriptor.intercore_sync),
        task_ration: descriptor.task_ration.encode(),
    };
    let object_len = to_word("object", object.len())?;

    let mut out = Vec::with_capacity(HEADER_LENGTH + binary_offset + WORD + object.len());
    PackedHeader::new(base, extension).write_to(&mut out);

    for name in &descriptor.kernel_list {
        out.extend_from_slice(&to_word("kernel name", name.len())?.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
    }

    out.extend_from_slice(&to_word("compile info", compile_info_padded)?.to_le_bytes());
    out.extend_from_slice(compile_info.as_bytes());
    out.resize(out.len() + compile_info_padded - compile_info.len(), 0);

    out.extend_from_slice(&object_len.to_le_bytes());
    out.extend_from_slice(object);

    log::trace!(
        "Packed {} kernel(s): compile_info_offset={}, binary_offset={}, total={}",
        descriptor.kernel_list.len(),
        names_len,
        binary_offset,
        out.len()
    );
    Ok(out)
}

/// Decoded container contents.
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedArtifact {
    pub header: PackedHeader,
    pub kernel_list: Vec<String>,
    /// Compile-info text including its NUL padding.
    pub compile_info: String,
    pub object: Vec<u8>,
}

impl UnpackedArtifact {
    /// Compile-info text up to the first NUL.
    pub fn compile_info_trimmed(&self) -> &str {
        match self.compile_info.find('\0') {
            Some(end) => &self.compile_info[..end],
            None => &self.compile_info,
        }
    }

    /// Rebuild the descriptor the container was packed from.
    pub fn to_descriptor(&self) -> Result<KernelDescriptor> {
        let base = &self.header.base;
        let extension = self.header.extension.unwrap_or_default();

        let magic = Magic::from_code(base.magic)
            .ok_or_else(|| KernelPackError::InvalidMagic(format!("0x{:08X}", base.magic)))?;
        let core_type = CoreType::from_code(base.core_type)
            .ok_or_else(|| KernelPackError::InvalidCoreType(base.core_type.to_string()))?;
        let compile_info = serde_json::from_str(self.compile_info_trimmed()).map_err(|e| {
            KernelPackError::InconsistentContainer(format!("compile info is not JSON: {}", e))
        })?;

        Ok(KernelDescriptor {
            magic,
            core_type,
            op_para_size: base.op_para_size,
            kernel_list: self.kernel_list.clone(),
            compile_info,
            intercore_sync: extension.intercore_sync != 0,
            task_ration: TaskRation::decode(extension.task_ration),
        })
    }
}

/// Decode a container blob, checking every offset against the buffer.
pub fn unpack(bytes: &[u8]) -> Result<UnpackedArtifact> {
    let header = PackedHeader::read_from(bytes)?;
    let base = header.base;

    if base.kernel_name_offset != 0 {
        return Err(KernelPackError::InconsistentContainer(format!(
            "kernel name table offset is {}, expected 0",
            base.kernel_name_offset
        )));
    }

    let data = &bytes[HEADER_LENGTH..];
    // Every name costs at least its length word.
    let kernel_num = base.kernel_num as usize;
    if kernel_num > data.len() / WORD {
        return Err(KernelPackError::Truncated {
            offset: HEADER_LENGTH,
            needed: kernel_num.saturating_mul(WORD),
            len: bytes.len(),
        });
    }
    let mut cursor = Cursor::new(data);

    let mut kernel_list = Vec::with_capacity(kernel_num);
    for _ in 0..base.kernel_num {
        let len = read_u32_le(&mut cursor)? as usize;
        kernel_list.push(read_string(&mut cursor, len, "kernel name")?);
    }

    if cursor.position() != u64::from(base.compile_info_offset) {
        return Err(KernelPackError::InconsistentContainer(format!(
            "kernel name table ends at {}, header says compile info starts at {}",
            cursor.position(),
            base.compile_info_offset
        )));
    }
    let info_len = read_u32_le(&mut cursor)? as usize;
    let compile_info = read_string(&mut cursor, info_len, "compile info")?;

    if cursor.position() != u64::from(base.binary_offset) {
        return Err(KernelPackError::InconsistentContainer(format!(
            "compile info ends at {}, header says binary starts at {}",
            cursor.position(),
            base.binary_offset
        )));
    }
    let object_len = read_u32_le(&mut cursor)? as usize;
    let remaining = data.len() - cursor.position() as usize;
    if remaining != object_len {
        return Err(KernelPackError::InconsistentContainer(format!(
            "binary size is {} but {} bytes follow it",
            object_len, remaining
        )));
    }
    let mut object = vec![0u8; object_len];
    read_exact(&mut cursor, &mut object)?;

    Ok(UnpackedArtifact {
        header,
        kernel_list,
        compile_info,
        object,
    })
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> Result<()> {
    let offset = HEADER_LENGTH + cursor.position() as usize;
    cursor
        .read_exact(buf)
        .map_err(|_| KernelPackError::Truncated {
            offset,
            needed: buf.len(),
            len: HEADER_LENGTH + cursor.get_ref().len(),
        })
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize, field: &'static str) -> Result<String> {
    let position = cursor.position() as usize;
    let remaining = cursor.get_ref().len().saturating_sub(position);
    if len > remaining {
        return Err(KernelPackError::Truncated {
            offset: HEADER_LENGTH + position,
            needed: len,
            len: HEADER_LENGTH + cursor.get_ref().len(),
        });
    }
    let mut buf = vec![0u8; len];
    read_exact(cursor, &mut buf)?;
    String::from_utf8(buf).map_err(|_| KernelPackError::InvalidUtf8 { field })
}
