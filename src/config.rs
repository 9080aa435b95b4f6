//! Build configuration
//!
//! Everything a build run needs besides the kernel source and the build
//! matrix: toolchain location, output directory, parallelism, and the
//! debug/sanitizer profile switches.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::build::FlagProfile;
use crate::error::{KernelPackError, Result};
use crate::target::Architecture;

/// Environment variable naming the source tree root (toolchain lives under it).
pub const CODE_ROOT_ENV: &str = "CODE_ROOT";

/// Environment variable overriding the enabled-target config file.
pub const BUILD_CONFIG_FILE_ENV: &str = "BUILD_CONFIG_FILE";

/// Environment variable naming the directory generated sources go to.
pub const CACHE_DIR_ENV: &str = "CACHE_DIR";

/// Environment variable naming the root of prebuilt per-architecture kernels.
pub const KERNEL_PATH_ENV: &str = "ASCEND_KERNEL_PATH";

/// Tactic table location relative to the code root.
pub const TACTIC_TABLE_PATH: &str = "configs/tbe_tactic_json.ini";

/// Default marker that makes an embedded container mutable.
pub const DEFAULT_MUTABLE_MARKER: &str = "g_opSystemRunCfg";

/// Build run configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Source tree root; the compiler and headers are found under it.
    pub code_root: PathBuf,
    /// Compiler override. Defaults to the bundled `ccec`.
    pub compiler: Option<PathBuf>,
    /// Linker override. Defaults to the bundled `ld.lld`.
    pub linker: Option<PathBuf>,
    /// Root for objects, linked artifacts, containers and generated sources.
    pub output_dir: PathBuf,
    /// Concurrent external jobs (0 = one per CPU).
    pub jobs: usize,
    pub debug: bool,
    pub sanitizer: bool,
    pub suppress_warnings: bool,
    /// Extra attempts for a failed compile or link (0 = fail immediately).
    pub retries: u32,
    /// Byte string in an object that forces a mutable embedded array.
    pub mutable_marker: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            code_root: PathBuf::from("."),
            compiler: None,
            linker: None,
            output_dir: PathBuf::from("build"),
            jobs: 0,
            debug: false,
            sanitizer: false,
            suppress_warnings: false,
            retries: 0,
            mutable_marker: DEFAULT_MUTABLE_MARKER.to_string(),
        }
    }
}

impl BuildConfig {
    fn toolchain_bin(&self) -> PathBuf {
        self.code_root
            .join("3rdparty")
            .join("compiler")
            .join("ccec_compiler")
            .join("bin")
    }

    pub fn compiler_path(&self) -> PathBuf {
        self.compiler
            .clone()
            .unwrap_or_else(|| self.toolchain_bin().join("ccec"))
    }

    pub fn linker_path(&self) -> PathBuf {
        self.linker
            .clone()
            .unwrap_or_else(|| self.toolchain_bin().join("ld.lld"))
    }

    /// Root of the kernel framework headers.
    pub fn tikcpp_root(&self) -> PathBuf {
        self.code_root.join("3rdparty").join("compiler").join("tikcpp")
    }

    pub fn profile(&self) -> FlagProfile {
        FlagProfile {
            debug: self.debug,
            sanitizer: self.sanitizer,
            suppress_warnings: self.suppress_warnings,
        }
    }
}

#[derive(Deserialize)]
struct TargetsFile {
    targets: Option<BTreeMap<String, serde_json::Value>>,
}

/// Load the globally enabled architectures from a build config file.
///
/// The file is `{"targets": {"<architecture>": true|false, ...}}`. At least
/// one architecture must be enabled.
pub fn load_enabled_targets(path: &Path) -> Result<BTreeSet<Architecture>> {
    let text = std::fs::read_to_string(path).map_err(|e| KernelPackError::io(path, e))?;
    parse_enabled_targets(&text, path)
}

pub fn parse_enabled_targets(text: &str, path: &Path) -> Result<BTreeSet<Architecture>> {
    let invalid = |reason: String| KernelPackError::InvalidConfig {
        path: path.to_path_buf(),
        reason,
    };

    let file: TargetsFile =
        serde_json::from_str(text).map_err(|e| invalid(format!("not a JSON object: {}", e)))?;
    let targets = file
        .targets
        .ok_or_else(|| invalid("key 'targets' is not found".to_string()))?;

    let mut enabled = BTreeSet::new();
    for (name, switch) in targets {
        let on = switch
            .as_bool()
            .ok_or_else(|| invalid(format!("target {} is {}, expected a boolean", name, switch)))?;
        let arch: Architecture = name.parse().map_err(|e| invalid(format!("{}", e)))?;
        if on {
            enabled.insert(arch);
        }
    }

    if enabled.is_empty() {
        return Err(invalid("no target device is set".to_string()));
    }
    Ok(enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(text: &str) -> Result<BTreeSet<Architecture>> {
        parse_enabled_targets(text, Path::new("build_config.json"))
    }

    #[test]
    fn test_default_config() {
        let config = BuildConfig::default();
        assert_eq!(config.jobs, 0);
        assert_eq!(config.retries, 0);
        assert_eq!(config.mutable_marker, DEFAULT_MUTABLE_MARKER);
        assert_eq!(
            config.compiler_path(),
            PathBuf::from("./3rdparty/compiler/ccec_compiler/bin/ccec")
        );
        assert_eq!(
            config.linker_path(),
            PathBuf::from("./3rdparty/compiler/ccec_compiler/bin/ld.lld")
        );
    }

    #[test]
    fn test_tool_overrides() {
        let config = BuildConfig {
            compiler: Some(PathBuf::from("/opt/cc")),
            ..Default::default()
        };
        assert_eq!(config.compiler_path(), PathBuf::from("/opt/cc"));
    }

    #[test]
    fn test_enabled_targets() {
        let enabled = parse(r#"{"targets": {"ascend910b": true, "ascend310p": false, "ascend310b": true}}"#)
            .unwrap();
        assert_eq!(
            enabled.into_iter().collect::<Vec<_>>(),
            vec![Architecture::Ascend910B, Architecture::Ascend310B]
        );
    }

    #[test]
    fn test_enabled_targets_errors() {
        assert!(parse("[]").is_err());
        assert!(parse(r#"{"other": {}}"#).is_err());
        assert!(parse(r#"{"targets": {"ascend910b": false}}"#).is_err());
        assert!(parse(r#"{"targets": {"ascend910b": "yes"}}"#).is_err());
        assert!(parse(r#"{"targets": {"riscv": true}}"#).is_err());
    }
}
