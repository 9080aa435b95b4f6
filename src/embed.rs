//! Generated C++ source embedding a packed container
//!
//! Each container becomes one byte array plus a `REG_KERNEL` statement the
//! runtime registry collects at static-init time.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::config::DEFAULT_MUTABLE_MARKER;
use crate::container::unpack;
use crate::error::{KernelPackError, Result};
use crate::target::Architecture;

const BYTES_PER_LINE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedOptions {
    /// Text in the object that forces a mutable array.
    pub mutable_marker: String,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            mutable_marker: DEFAULT_MUTABLE_MARKER.to_string(),
        }
    }
}

/// Rendered fragment ready to be written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSource {
    pub symbol: String,
    /// True when the array is declared without `const`.
    pub mutable: bool,
    pub text: String,
}

/// Array name for a kernel on an architecture.
pub fn symbol_name(kernel_id: &str, architecture: Architecture) -> String {
    format!("kernelBin_{}_{}", kernel_id, architecture)
}

/// True if the object needs link-time writable relocation.
pub fn requires_mutable_storage(object: &[u8], marker: &str) -> bool {
    let marker = marker.as_bytes();
    !marker.is_empty() && object.windows(marker.len()).any(|w| w == marker)
}

/// Render the fragment registering `packed` under (architecture, kernel_id).
pub fn render(
    packed: &[u8],
    kernel_id: &str,
    architecture: Architecture,
    options: &EmbedOptions,
) -> Result<GeneratedSource> {
    let object = unpack(packed)?.object;
    let mutable = requires_mutable_storage(&object, &options.mutable_marker);
    let symbol = symbol_name(kernel_id, architecture);
    let qualifier = if mutable { "static" } else { "static const" };

    let mut text = String::with_capacity(packed.len() * 6 + 256);
    text.push_str("#include <cstdint>\n#include \"mki_loader/op_register.h\"\n");
    text.push_str("namespace OpSpace {\n");
    let _ = write!(text, "{} uint8_t {}[] = {{", qualifier, symbol);
    for (i, chunk) in packed.chunks(BYTES_PER_LINE).enumerate() {
        if i > 0 {
            text.push(',');
        }
        text.push_str("\n    ");
        let line: Vec<String> = chunk.iter().map(|b| format!("0x{:02x}", b)).collect();
        text.push_str(&line.join(", "));
    }
    text.push_str("\n};\n\n");
    let _ = writeln!(text, "REG_KERNEL({}, {}, {});", architecture, kernel_id, symbol);
    text.push_str("}\n");

    if mutable {
        log::debug!("{}: object carries '{}', emitting mutable array", symbol, options.mutable_marker);
    }
    Ok(GeneratedSource {
        symbol,
        mutable,
        text,
    })
}

pub fn write_source(path: &Path, source: &GeneratedSource) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| KernelPackError::io(parent, e))?;
    }
    fs::write(path, &source.text).map_err(|e| KernelPackError::io(path, e))?;
    log::info!("Generated {} ({})", path.display(), source.symbol);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::pack;
    use crate::descriptor::{CoreType, KernelDescriptor, Magic, TaskRation};
    use pretty_assertions::assert_eq;

    fn packed(object: &[u8]) -> Vec<u8> {
        let descriptor = KernelDescriptor {
            magic: Magic::Elf,
            core_type: CoreType::ComputeCore,
            op_para_size: 0,
            kernel_list: vec!["add_0".to_string()],
            compile_info: serde_json::json!({}),
            intercore_sync: false,
            task_ration: TaskRation::ByKey,
        };
        pack(&descriptor, object).unwrap()
    }

    #[test]
    fn test_render_layout() {
        let bytes = packed(&[1, 2, 3]);
        let out = render(&bytes, "AddKernel", Architecture::Ascend910B, &EmbedOptions::default()).unwrap();

        assert_eq!(out.symbol, "kernelBin_AddKernel_ascend910b");
        assert!(!out.mutable);
        assert!(out.text.starts_with(
            "#include <cstdint>\n#include \"mki_loader/op_register.h\"\nnamespace OpSpace {\n\
             static const uint8_t kernelBin_AddKernel_ascend910b[] = {\n    0x00, 0x00"
        ));
        assert!(out.text.ends_with(
            "\n};\n\nREG_KERNEL(ascend910b, AddKernel, kernelBin_AddKernel_ascend910b);\n}\n"
        ));

        let array_lines = out.text.lines().filter(|l| l.starts_with("    0x")).count();
        assert_eq!(array_lines, (bytes.len() + BYTES_PER_LINE - 1) / BYTES_PER_LINE);
        let emitted = out.text.matches("0x").count();
        assert_eq!(emitted, bytes.len());
    }

    #[test]
    fn test_marker_makes_array_mutable() {
        let bytes = packed(b"\x7fELF....g_opSystemRunCfg....");
        let out = render(&bytes, "AddKernel", Architecture::Ascend310P, &EmbedOptions::default()).unwrap();
        assert!(out.mutable);
        assert!(out.text.contains("\nstatic uint8_t kernelBin_AddKernel_ascend310p[]"));

        let custom = EmbedOptions {
            mutable_marker: "nothing_here".to_string(),
        };
        let out = render(&bytes, "AddKernel", Architecture::Ascend310P, &custom).unwrap();
        assert!(!out.mutable);
    }

    #[test]
    fn test_marker_search() {
        assert!(requires_mutable_storage(b"abc_marker_def", "marker"));
        assert!(!requires_mutable_storage(b"abc", "marker"));
        assert!(!requires_mutable_storage(b"abc", ""));
    }

    #[test]
    fn test_render_rejects_non_container() {
        assert!(render(&[0u8; 12], "AddKernel", Architecture::Ascend910, &EmbedOptions::default()).is_err());
    }

    #[test]
    fn test_write_source_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let out = render(&packed(&[9]), "K", Architecture::Ascend910, &EmbedOptions::default()).unwrap();
        let path = dir.path().join("gen").join("ascend910").join("K.cpp");
        write_source(&path, &out).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), out.text);
    }
}
