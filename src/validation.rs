//! Container validation helpers
//!
//! Cheap structural checks on a packed container before it is embedded
//! or inspected. Catches the obvious mistakes (wrong file, truncated
//! copy) with better messages than a full unpack failure.

use crate::container::{HEADER_LENGTH, HEADER_VERSION, WORD};
use crate::descriptor::{CoreType, Magic};

fn word(bytes: &[u8], index: usize) -> u32 {
    let at = index * WORD;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Validate a packed container's fixed header.
///
/// Performs basic sanity checks:
/// - Minimum size (fixed header plus the binary size word)
/// - Supported version
/// - Known magic and core type
/// - A kernel count the blob can hold
/// - Offsets that stay inside the blob
///
/// # Note
///
/// This does not walk the string tables. Use [`crate::container::unpack`]
/// for a complete check.
pub fn validate_container(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < HEADER_LENGTH + WORD {
        return Err(format!(
            "container too small: {} bytes (minimum {})",
            bytes.len(),
            HEADER_LENGTH + WORD
        ));
    }

    let version = word(bytes, 0);
    if version > HEADER_VERSION {
        return Err(format!(
            "unsupported container version {} (supported: 0-{})",
            version, HEADER_VERSION
        ));
    }

    let magic = word(bytes, 1);
    if Magic::from_code(magic).is_none() {
        return Err(format!("invalid container magic: 0x{:08x}", magic));
    }

    let core_type = word(bytes, 3);
    if CoreType::from_code(core_type).is_none() {
        return Err(format!("invalid core type code {}", core_type));
    }

    let kernel_num = word(bytes, 4) as usize;
    if kernel_num == 0 {
        return Err("container declares no kernels".to_string());
    }
    if kernel_num > (bytes.len() - HEADER_LENGTH) / WORD {
        return Err(format!(
            "{} kernels cannot fit in a {}-byte container",
            kernel_num,
            bytes.len()
        ));
    }

    let compile_info_offset = word(bytes, 6) as usize;
    let binary_offset = word(bytes, 7) as usize;
    if compile_info_offset >= binary_offset {
        return Err(format!(
            "compile info offset {} is not before binary offset {}",
            compile_info_offset, binary_offset
        ));
    }
    if HEADER_LENGTH + binary_offset + WORD > bytes.len() {
        return Err(format!(
            "binary offset {} points past the end ({} bytes)",
            binary_offset,
            bytes.len()
        ));
    }

    log::trace!(
        "Container validated: magic 0x{:08x}, {} kernel(s), size {}",
        magic,
        word(bytes, 4),
        bytes.len()
    );

    Ok(())
}

/// Check if bytes look like a container (quick magic check).
#[inline]
pub fn is_container(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LENGTH && Magic::from_code(word(bytes, 1)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::pack;
    use crate::descriptor::{KernelDescriptor, TaskRation};

    fn make_valid_container() -> Vec<u8> {
        let descriptor = KernelDescriptor {
            magic: Magic::ElfAiVec,
            core_type: CoreType::VectorCore,
            op_para_size: 16,
            kernel_list: vec!["add_0".to_string()],
            compile_info: serde_json::json!({}),
            intercore_sync: false,
            task_ration: TaskRation::ByKey,
        };
        pack(&descriptor, &[0u8; 8]).unwrap()
    }

    #[test]
    fn test_valid_container() {
        let bytes = make_valid_container();
        let result = validate_container(&bytes);
        assert!(result.is_ok(), "Expected valid container, got: {:?}", result);
        assert!(is_container(&bytes));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = make_valid_container();
        bytes[4] = 0x00; // Corrupt magic
        let err = validate_container(&bytes).unwrap_err();
        assert!(err.contains("magic"), "Expected magic error, got: {}", err);
        assert!(!is_container(&bytes));
    }

    #[test]
    fn test_too_small() {
        let result = validate_container(&[0u8; 16]);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("too small"));
    }

    #[test]
    fn test_future_version() {
        let mut bytes = make_valid_container();
        bytes[0] = 0x01;
        let err = validate_container(&bytes).unwrap_err();
        assert!(err.contains("version"), "Expected version error, got: {}", err);
    }

    #[test]
    fn test_kernel_count_bounded_by_size() {
        let mut bytes = make_valid_container();
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = validate_container(&bytes).unwrap_err();
        assert!(err.contains("cannot fit"), "Expected kernel count error, got: {}", err);
    }

    #[test]
    fn test_offset_past_end() {
        let mut bytes = make_valid_container();
        // Binary offset is word 7
        bytes[28..32].copy_from_slice(&10_000u32.to_le_bytes());
        let err = validate_container(&bytes).unwrap_err();
        assert!(err.contains("past the end"), "Expected offset error, got: {}", err);
    }
}
