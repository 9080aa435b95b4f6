//! External compiler and linker
//!
//! The orchestrator only ever talks to a [`Toolchain`]. The process-backed
//! implementation shells out to the bundled `ccec` and `ld.lld`; tests
//! substitute a recording fake.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::BuildConfig;
use crate::error::{KernelPackError, Result};
use crate::target::{BuildTarget, MixHalf};

/// One compiler run producing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileInvocation {
    pub target: BuildTarget,
    pub key: u64,
    pub half: Option<MixHalf>,
    pub sub_arch: &'static str,
    /// Symbol the kernel entry point is renamed to.
    pub exported_symbol: String,
    pub source: PathBuf,
    pub output: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
}

impl CompileInvocation {
    /// Short name for logs and errors, e.g. `add_custom_3_mix_cube@ascend910b`.
    pub fn label(&self) -> String {
        format!("{}@{}", self.exported_symbol, self.target.architecture)
    }
}

/// One linker run merging a target's objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInvocation {
    pub label: String,
    pub objects: Vec<PathBuf>,
    pub output: PathBuf,
    pub args: Vec<String>,
}

/// Runs the device compiler and linker.
///
/// Implementations must be callable from several worker threads at once.
pub trait Toolchain: Send + Sync {
    fn compile(&self, invocation: &CompileInvocation) -> Result<()>;
    fn link(&self, invocation: &LinkInvocation) -> Result<()>;
}

/// Toolchain backed by real processes.
#[derive(Debug, Clone)]
pub struct ProcessToolchain {
    compiler: PathBuf,
    linker: PathBuf,
}

impl ProcessToolchain {
    pub fn new(compiler: impl Into<PathBuf>, linker: impl Into<PathBuf>) -> Self {
        Self {
            compiler: compiler.into(),
            linker: linker.into(),
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(config.compiler_path(), config.linker_path())
    }

    fn run(&self, program: &Path, args: &[String], label: &str, output: &Path) -> Result<()> {
        let tool = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        log::debug!("{} {}", program.display(), args.join(" "));

        let result = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| KernelPackError::ToolSpawn {
                tool: tool.clone(),
                target: label.to_string(),
                source,
            })?;

        if !result.status.success() {
            return Err(KernelPackError::ToolFailed {
                tool,
                target: label.to_string(),
                code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }

        if !output.exists() {
            return Err(KernelPackError::MissingOutput {
                path: output.to_path_buf(),
            });
        }

        Ok(())
    }
}

impl Toolchain for ProcessToolchain {
    fn compile(&self, invocation: &CompileInvocation) -> Result<()> {
        self.run(
            &self.compiler,
            &invocation.args,
            &invocation.label(),
            &invocation.output,
        )
    }

    fn link(&self, invocation: &LinkInvocation) -> Result<()> {
        self.run(
            &self.linker,
            &invocation.args,
            &invocation.label,
            &invocation.output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Architecture, Channel};

    fn invocation(output: PathBuf) -> LinkInvocation {
        LinkInvocation {
            label: "add@ascend910b".to_string(),
            objects: Vec::new(),
            output,
            args: Vec::new(),
        }
    }

    #[test]
    fn test_label() {
        let inv = CompileInvocation {
            target: BuildTarget::new(Architecture::Ascend910B, Channel::Mix).unwrap(),
            key: 3,
            half: Some(MixHalf::Cube),
            sub_arch: "dav-c220-cube",
            exported_symbol: "add_3_mix_cube".to_string(),
            source: PathBuf::from("add.cpp"),
            output: PathBuf::from("add_mix_cube_3.o"),
            args: Vec::new(),
        };
        assert_eq!(inv.label(), "add_3_mix_cube@ascend910b");
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let tools = ProcessToolchain::new("/nonexistent/ccec", "/nonexistent/ld.lld");
        let err = tools.link(&invocation(PathBuf::from("out.o"))).unwrap_err();
        assert!(matches!(err, KernelPackError::ToolSpawn { ref tool, .. } if tool == "ld.lld"));
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_is_tool_failure() {
        let tools = ProcessToolchain::new("false", "false");
        let err = tools.link(&invocation(PathBuf::from("out.o"))).unwrap_err();
        assert!(matches!(err, KernelPackError::ToolFailed { .. }));
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn test_success_without_output_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ProcessToolchain::new("true", "true");
        let err = tools.link(&invocation(dir.path().join("never.o"))).unwrap_err();
        assert!(matches!(err, KernelPackError::MissingOutput { .. }));
    }
}
