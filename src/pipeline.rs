//! End-to-end kernel packaging
//!
//! build (compile + link) -> load descriptor -> pack -> embed. Every file
//! this stage writes is removed again if any later step fails, so a failed
//! run never leaves a registered container behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::build::{BuildStats, LinkedArtifact, Orchestrator, Toolchain};
use crate::config::BuildConfig;
use crate::container::pack;
use crate::descriptor::load_descriptor;
use crate::embed::{render, write_source, EmbedOptions};
use crate::error::{KernelPackError, Result};
use crate::matrix::BuildMatrix;
use crate::source::KernelSource;
use crate::target::{BuildTarget, Channel};

/// One artifact carried all the way to generated source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedArtifact {
    pub linked: LinkedArtifact,
    pub container: PathBuf,
    pub generated: PathBuf,
    pub mutable: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub artifacts: Vec<PackagedArtifact>,
    pub stats: BuildStats,
}

pub struct Pipeline<'a> {
    config: &'a BuildConfig,
    toolchain: &'a dyn Toolchain,
    abort: Arc<AtomicBool>,
    generated_dir: PathBuf,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a BuildConfig, toolchain: &'a dyn Toolchain) -> Self {
        Self {
            config,
            toolchain,
            abort: Arc::new(AtomicBool::new(false)),
            generated_dir: config.output_dir.join("generated"),
        }
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Directory generated `.cpp` fragments are written under.
    pub fn with_generated_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.generated_dir = dir.into();
        self
    }

    pub fn generated_path(&self, kernel_id: &str, target: BuildTarget) -> PathBuf {
        self.generated_dir
            .join(target.architecture.name())
            .join(format!("{}.cpp", kernel_id))
    }

    /// Build, pack and embed `source` for every target.
    pub fn run(&self, source: &KernelSource, targets: &[BuildTarget]) -> Result<PipelineOutput> {
        let orchestrator =
            Orchestrator::new(self.config, self.toolchain).with_abort_flag(Arc::clone(&self.abort));

        let mut written = Vec::new();
        let result = orchestrator
            .build(source, targets)
            .and_then(|linked| self.package_all(linked, &mut written));

        match result {
            Ok(artifacts) => Ok(PipelineOutput {
                artifacts,
                stats: orchestrator.stats(),
            }),
            Err(e) => {
                remove_outputs(&written);
                Err(e)
            }
        }
    }

    fn package_all(&self, linked: Vec<LinkedArtifact>, written: &mut Vec<PathBuf>) -> Result<Vec<PackagedArtifact>> {
        let options = EmbedOptions {
            mutable_marker: self.config.mutable_marker.clone(),
        };
        linked
            .into_iter()
            .map(|artifact| self.package(artifact, &options, written))
            .collect()
    }

    fn package(
        &self,
        linked: LinkedArtifact,
        options: &EmbedOptions,
        written: &mut Vec<PathBuf>,
    ) -> Result<PackagedArtifact> {
        let container = linked.artifact.with_extension("bin");
        let packed = pack_files(&linked.descriptor, &linked.artifact)?;
        fs::write(&container, &packed).map_err(|e| KernelPackError::io(&container, e))?;
        written.push(container.clone());

        let generated = self.generated_path(&linked.kernel_id, linked.target);
        let source = render(&packed, &linked.kernel_id, linked.target.architecture, options)?;
        written.push(generated.clone());
        write_source(&generated, &source)?;

        Ok(PackagedArtifact {
            linked,
            container,
            generated,
            mutable: source.mutable,
        })
    }
}

/// Pack an object with the descriptor written beside it.
pub fn pack_files(descriptor_path: &Path, object_path: &Path) -> Result<Vec<u8>> {
    let descriptor = load_descriptor(descriptor_path)?;
    let object = fs::read(object_path).map_err(|e| KernelPackError::io(object_path, e))?;
    let packed = pack(&descriptor, &object)?;

    #[cfg(feature = "validate_determinism")]
    {
        if pack(&descriptor, &object)? != packed {
            return Err(KernelPackError::NonDeterministic(object_path.display().to_string()));
        }
    }

    log::debug!(
        "Packed {} ({} bytes, {} kernel(s))",
        object_path.display(),
        packed.len(),
        descriptor.kernel_list.len()
    );
    Ok(packed)
}

/// Targets `kernel` must be built for on `channel` according to `matrix`.
pub fn targets_from_matrix(matrix: &BuildMatrix, kernel: &str, channel: Channel) -> Result<Vec<BuildTarget>> {
    matrix
        .architectures_to_build(kernel)
        .into_iter()
        .map(|arch| BuildTarget::new(arch, channel))
        .collect()
}

fn remove_outputs(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("Removed partial output {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{CompileInvocation, LinkInvocation};
    use crate::matrix::{resolve, DeclaredMatrix, ReuseSet};
    use crate::target::Architecture;
    use std::collections::BTreeSet;

    struct FakeToolchain;

    impl Toolchain for FakeToolchain {
        fn compile(&self, invocation: &CompileInvocation) -> Result<()> {
            fs::write(&invocation.output, invocation.exported_symbol.as_bytes()).unwrap();
            Ok(())
        }

        fn link(&self, invocation: &LinkInvocation) -> Result<()> {
            fs::write(&invocation.output, b"\x7fELF linked").unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_targets_from_matrix() {
        let mut declared = DeclaredMatrix::new();
        declared
            .declare("AddOperation", "AddKernel", "ascend910b", true)
            .declare("AddOperation", "AddKernel", "ascend310p", true);
        let enabled = BTreeSet::from([Architecture::Ascend910B, Architecture::Ascend310P]);
        let matrix = resolve(&declared, &enabled, &ReuseSet::new()).unwrap();

        let targets = targets_from_matrix(&matrix, "AddKernel", Channel::Vector).unwrap();
        assert_eq!(targets.len(), 2);

        // ascend310p has no mix split
        let err = targets_from_matrix(&matrix, "AddKernel", Channel::Mix).unwrap_err();
        assert!(matches!(err, KernelPackError::UnsupportedChannel { .. }));
    }

    #[test]
    fn test_pack_files_missing_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let err = pack_files(&dir.path().join("k.json"), &dir.path().join("k.o")).unwrap_err();
        assert!(matches!(err, KernelPackError::DescriptorNotFound { .. }));
    }

    #[test]
    fn test_failed_embed_removes_container() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("k.cpp");
        fs::write(&src, "TILING_KEY_IS(1)").unwrap();
        let config = BuildConfig {
            output_dir: dir.path().join("out"),
            ..Default::default()
        };
        // A file where the generated directory should be makes embedding fail.
        let blocker = dir.path().join("blocked");
        fs::write(&blocker, b"").unwrap();

        let tools = FakeToolchain;
        let pipeline = Pipeline::new(&config, &tools).with_generated_dir(&blocker);
        let target = BuildTarget::new(Architecture::Ascend910, Channel::Vector).unwrap();
        let source = KernelSource::new(&src, "k", "K");

        assert!(pipeline.run(&source, &[target]).is_err());
        let container = config.output_dir.join("ascend910").join("K").join("K.bin");
        assert!(!container.exists());
    }
}
