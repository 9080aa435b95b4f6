//! Kernel descriptors
//!
//! A descriptor is the JSON metadata file written next to each linked
//! kernel artifact. It names the symbols in the artifact and carries the
//! fields the packed container header needs.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KernelPackError, Result};

/// Keys every descriptor must carry (besides the kernel names).
const REQUIRED_KEYS: [&str; 4] = ["compileInfo", "opParaSize", "coreType", "magic"];

/// Sentinel task ration: dispatch by specialization key.
pub const TASK_RATION_BY_KEY: &str = "tilingKey";

/// Binary container flavor, stored as a 32-bit tag in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Elf,
    ElfAiVec,
    ElfAiCube,
}

impl Magic {
    pub const ALL: [Magic; 3] = [Magic::Elf, Magic::ElfAiVec, Magic::ElfAiCube];

    pub fn code(self) -> u32 {
        match self {
            Magic::Elf => 0x4355_4245,
            Magic::ElfAiVec => 0x4141_5246,
            Magic::ElfAiCube => 0x4149_4343,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Magic::Elf => "RT_DEV_BINARY_MAGIC_ELF",
            Magic::ElfAiVec => "RT_DEV_BINARY_MAGIC_ELF_AIVEC",
            Magic::ElfAiCube => "RT_DEV_BINARY_MAGIC_ELF_AICUBE",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Magic::ALL.into_iter().find(|m| m.code() == code)
    }
}

impl FromStr for Magic {
    type Err = KernelPackError;

    fn from_str(s: &str) -> Result<Self> {
        Magic::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| KernelPackError::InvalidMagic(s.to_string()))
    }
}

/// Execution unit the artifact runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreType {
    ComputeCore,
    VectorCore,
    Mixed,
}

impl CoreType {
    pub fn code(self) -> u32 {
        match self {
            CoreType::ComputeCore => 0,
            CoreType::VectorCore => 2,
            CoreType::Mixed => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(CoreType::ComputeCore),
            2 => Some(CoreType::VectorCore),
            4 => Some(CoreType::Mixed),
            _ => None,
        }
    }

    /// Name written into generated descriptors.
    pub fn name(self) -> &'static str {
        match self {
            CoreType::ComputeCore => "AiCore",
            CoreType::VectorCore => "VectorCore",
            CoreType::Mixed => "MIX",
        }
    }
}

impl FromStr for CoreType {
    type Err = KernelPackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AiCore" | "ComputeCore" => Ok(CoreType::ComputeCore),
            "VectorCore" => Ok(CoreType::VectorCore),
            "MIX" | "Mixed" => Ok(CoreType::Mixed),
            other => Err(KernelPackError::InvalidCoreType(other.to_string())),
        }
    }
}

/// Dispatch policy between cube and vector units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskRation {
    /// Dispatch selected by the specialization key; encodes to 0.
    #[default]
    ByKey,
    /// Fixed `cube:vector` ratio; encodes to `(cube << 16) | vector`.
    Ratio { cube: u16, vector: u16 },
}

impl TaskRation {
    pub fn encode(self) -> u32 {
        match self {
            TaskRation::ByKey => 0,
            TaskRation::Ratio { cube, vector } => (u32::from(cube) << 16) | u32::from(vector),
        }
    }

    pub fn decode(word: u32) -> Self {
        if word == 0 {
            return TaskRation::ByKey;
        }
        TaskRation::Ratio {
            cube: (word >> 16) as u16,
            vector: (word & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for TaskRation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskRation::ByKey => f.write_str(TASK_RATION_BY_KEY),
            TaskRation::Ratio { cube, vector } => write!(f, "{}:{}", cube, vector),
        }
    }
}

impl FromStr for TaskRation {
    type Err = KernelPackError;

    fn from_str(s: &str) -> Result<Self> {
        if s == TASK_RATION_BY_KEY || s == "dispatch-by-specialization-key" {
            return Ok(TaskRation::ByKey);
        }
        let invalid = || KernelPackError::InvalidTaskRation(s.to_string());

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err(invalid());
        }
        let mut values = [0u16; 2];
        for (slot, part) in values.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }
        // 0:0 would encode to the by-key sentinel
        if values == [0, 0] {
            return Err(invalid());
        }
        Ok(TaskRation::Ratio {
            cube: values[0],
            vector: values[1],
        })
    }
}

/// Validated contents of a descriptor file.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDescriptor {
    pub magic: Magic,
    pub core_type: CoreType,
    pub op_para_size: u32,
    pub kernel_list: Vec<String>,
    pub compile_info: Value,
    pub intercore_sync: bool,
    pub task_ration: TaskRation,
}

impl KernelDescriptor {
    /// Compile info as the text blob stored in the container.
    ///
    /// Uses `", "` and `": "` separators and keeps key order, so the
    /// text matches what the rest of the toolchain produces.
    pub fn compile_info_text(&self) -> String {
        render_compile_info(&self.compile_info)
    }

    /// JSON document for this descriptor, as written next to an artifact.
    pub fn to_json(&self, bin_file_name: &str, sha256: &str) -> Value {
        let kernel_list: Vec<Value> = self
            .kernel_list
            .iter()
            .map(|name| serde_json::json!({ "kernelName": name }))
            .collect();

        serde_json::json!({
            "binFileName": bin_file_name,
            "binFileSuffix": ".o",
            "coreType": self.core_type.name(),
            "intercoreSync": u32::from(self.intercore_sync),
            "magic": self.magic.name(),
            "opParaSize": self.op_para_size,
            "taskRation": self.task_ration.to_string(),
            "sha256": sha256,
            "kernelList": kernel_list,
            "compileInfo": self.compile_info,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KernelListEntry {
    Named {
        #[serde(rename = "kernelName")]
        kernel_name: String,
    },
    Bare(String),
}

impl KernelListEntry {
    fn into_name(self) -> String {
        match self {
            KernelListEntry::Named { kernel_name } => kernel_name,
            KernelListEntry::Bare(name) => name,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    magic: String,
    core_type: String,
    op_para_size: u32,
    compile_info: Value,
    kernel_list: Option<Vec<KernelListEntry>>,
    kernel_name: Option<String>,
    #[serde(default)]
    intercore_sync: u32,
    task_ration: Option<String>,
}

/// Load and validate a descriptor file.
pub fn load_descriptor(path: &Path) -> Result<KernelDescriptor> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            KernelPackError::DescriptorNotFound {
                path: path.to_path_buf(),
            }
        } else {
            KernelPackError::io(path, e)
        }
    })?;

    let descriptor = parse_descriptor(&text, path)?;
    log::debug!(
        "Loaded descriptor {}: {} kernel(s), magic={}",
        path.display(),
        descriptor.kernel_list.len(),
        descriptor.magic.name()
    );
    Ok(descriptor)
}

/// Parse descriptor text. `path` is only used to label errors.
pub fn parse_descriptor(text: &str, path: &Path) -> Result<KernelDescriptor> {
    let malformed = |source| KernelPackError::MalformedDescriptor {
        path: path.to_path_buf(),
        source,
    };

    let value: Value = serde_json::from_str(text).map_err(malformed)?;
    if let Some(object) = value.as_object() {
        for key in REQUIRED_KEYS {
            if !object.contains_key(key) {
                return Err(KernelPackError::MissingKey {
                    path: path.to_path_buf(),
                    key,
                });
            }
        }
        if !object.contains_key("kernelList") && !object.contains_key("kernelName") {
            return Err(KernelPackError::MissingKey {
                path: path.to_path_buf(),
                key: "kernelList",
            });
        }
    }
    let raw: RawDescriptor = serde_json::from_value(value).map_err(malformed)?;

    let invalid = |source: KernelPackError| KernelPackError::InvalidDescriptor {
        path: path.to_path_buf(),
        source: Box::new(source),
    };

    let magic: Magic = raw.magic.parse().map_err(invalid)?;
    let core_type: CoreType = raw.core_type.parse().map_err(invalid)?;
    let task_ration = match raw.task_ration.as_deref() {
        Some(text) => text.parse().map_err(invalid)?,
        None => TaskRation::ByKey,
    };
    let intercore_sync = match raw.intercore_sync {
        0 => false,
        1 => true,
        other => {
            return Err(invalid(KernelPackError::InvalidIntercoreSync(other)))
        }
    };

    let kernel_list: Vec<String> = match (raw.kernel_list, raw.kernel_name) {
        (Some(list), _) => list.into_iter().map(KernelListEntry::into_name).collect(),
        (None, Some(name)) => vec![name],
        (None, None) => Vec::new(),
    };
    if kernel_list.is_empty() {
        return Err(KernelPackError::EmptyKernelList {
            path: path.to_path_buf(),
        });
    }

    Ok(KernelDescriptor {
        magic,
        core_type,
        op_para_size: raw.op_para_size,
        kernel_list,
        compile_info: raw.compile_info,
        intercore_sync,
        task_ration,
    })
}

/// JSON formatter with a space after `,` and `:` and non-ASCII text
/// written as `\uXXXX` escapes.
struct SpacedFormatter;

impl serde_json::ser::Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

fn render_compile_info(value: &Value) -> String {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    // Writing a Value into a Vec cannot fail
    if value.serialize(&mut ser).is_err() {
        return value.to_string();
    }
    String::from_utf8(buf).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn parse(text: &str) -> Result<KernelDescriptor> {
        parse_descriptor(text, &PathBuf::from("k.json"))
    }

    const VALID: &str = r#"{
        "magic": "RT_DEV_BINARY_MAGIC_ELF_AIVEC",
        "coreType": "VectorCore",
        "opParaSize": 8,
        "kernelList": [{"kernelName": "add_0"}, {"kernelName": "add_5"}],
        "compileInfo": {"b": 2, "a": [1, 2]},
        "intercoreSync": 1,
        "taskRation": "1:2"
    }"#;

    #[test]
    fn test_parse_valid() {
        let d = parse(VALID).unwrap();
        assert_eq!(d.magic, Magic::ElfAiVec);
        assert_eq!(d.core_type, CoreType::VectorCore);
        assert_eq!(d.op_para_size, 8);
        assert_eq!(d.kernel_list, vec!["add_0".to_string(), "add_5".to_string()]);
        assert!(d.intercore_sync);
        assert_eq!(d.task_ration, TaskRation::Ratio { cube: 1, vector: 2 });
        assert_eq!(d.compile_info_text(), r#"{"b": 2, "a": [1, 2]}"#);
    }

    #[test]
    fn test_compile_info_escapes_non_ascii() {
        let mut d = parse(VALID).unwrap();
        d.compile_info = serde_json::json!({"name": "caf\u{e9} \u{1F600}", "q": "a\"b"});
        assert_eq!(
            d.compile_info_text(),
            r#"{"name": "caf\u00e9 \ud83d\ude00", "q": "a\"b"}"#
        );
        assert!(d.compile_info_text().is_ascii());
    }

    #[test]
    fn test_single_kernel_name_and_defaults() {
        let d = parse(
            r#"{"magic": "RT_DEV_BINARY_MAGIC_ELF", "coreType": "AiCore",
                "opParaSize": 0, "kernelName": "mul", "compileInfo": {}}"#,
        )
        .unwrap();
        assert_eq!(d.kernel_list, vec!["mul".to_string()]);
        assert!(!d.intercore_sync);
        assert_eq!(d.task_ration, TaskRation::ByKey);
        assert_eq!(d.compile_info_text(), "{}");
    }

    #[test]
    fn test_bare_kernel_list() {
        let d = parse(
            r#"{"magic": "RT_DEV_BINARY_MAGIC_ELF", "coreType": "ComputeCore",
                "opParaSize": 0, "kernelList": ["k_0"], "compileInfo": {"x": 1}}"#,
        )
        .unwrap();
        assert_eq!(d.kernel_list, vec!["k_0".to_string()]);
        assert_eq!(d.compile_info_text(), r#"{"x": 1}"#);
    }

    #[test]
    fn test_missing_key() {
        let err = parse(r#"{"magic": "RT_DEV_BINARY_MAGIC_ELF", "coreType": "AiCore", "kernelName": "k", "compileInfo": {}}"#)
            .unwrap_err();
        assert!(matches!(err, KernelPackError::MissingKey { key: "opParaSize", .. }));

        let err = parse(r#"{"magic": "RT_DEV_BINARY_MAGIC_ELF", "coreType": "AiCore", "opParaSize": 0, "compileInfo": {}}"#)
            .unwrap_err();
        assert!(matches!(err, KernelPackError::MissingKey { key: "kernelList", .. }));
    }

    #[test]
    fn test_malformed_json() {
        let err = parse("{not json").unwrap_err();
        assert!(matches!(err, KernelPackError::MalformedDescriptor { .. }));

        // Wrong type for a known field is also malformed
        let err = parse(
            r#"{"magic": "RT_DEV_BINARY_MAGIC_ELF", "coreType": "AiCore",
                "opParaSize": "eight", "kernelName": "k", "compileInfo": {}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, KernelPackError::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_invalid_magic() {
        let err = parse(
            r#"{"magic": "RT_DEV_BINARY_MAGIC_PE", "coreType": "AiCore",
                "opParaSize": 0, "kernelName": "k", "compileInfo": {}}"#,
        )
        .unwrap_err();
        match err {
            KernelPackError::InvalidDescriptor { path, source } => {
                assert_eq!(path, PathBuf::from("k.json"));
                assert!(matches!(*source, KernelPackError::InvalidMagic(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_kernel_list() {
        let err = parse(
            r#"{"magic": "RT_DEV_BINARY_MAGIC_ELF", "coreType": "AiCore",
                "opParaSize": 0, "kernelList": [], "compileInfo": {}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, KernelPackError::EmptyKernelList { .. }));
    }

    #[test]
    fn test_file_not_found() {
        let err = load_descriptor(Path::new("/nonexistent/kernel.json")).unwrap_err();
        assert!(matches!(err, KernelPackError::DescriptorNotFound { .. }));
    }

    #[test]
    fn test_task_ration_parse() {
        assert_eq!("tilingKey".parse::<TaskRation>().unwrap(), TaskRation::ByKey);
        assert_eq!(
            "dispatch-by-specialization-key".parse::<TaskRation>().unwrap(),
            TaskRation::ByKey
        );
        assert_eq!("1:2".parse::<TaskRation>().unwrap().encode(), (1 << 16) | 2);
        for bad in ["1:2:3", "a:b", "1:", ":2", "-1:2", "+1:2", "65536:1", "0:0", ""] {
            assert!(bad.parse::<TaskRation>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_task_ration_decode_inverts_encode() {
        let ratio = TaskRation::Ratio { cube: 3, vector: 7 };
        assert_eq!(TaskRation::decode(ratio.encode()), ratio);
        assert_eq!(TaskRation::decode(0), TaskRation::ByKey);
    }

    #[test]
    fn test_to_json_reparses() {
        let d = parse(VALID).unwrap();
        let json = d.to_json("add", "00");
        let reparsed = parse(&json.to_string()).unwrap();
        assert_eq!(reparsed, d);
    }
}
