//! End-to-end pipeline tests against a fake toolchain

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use kernel_packer::build::{CompileInvocation, LinkInvocation};
use kernel_packer::pipeline::targets_from_matrix;
use kernel_packer::{
    unpack, Architecture, BuildConfig, BuildTarget, Channel, CoreType, DeclaredMatrix, KernelPackError,
    KernelSource, Magic, Pipeline, Result, ReuseSet, TaskRation, Toolchain,
};
use pretty_assertions::assert_eq;

/// Objects contain their exported symbol; links concatenate objects.
#[derive(Default)]
struct FakeToolchain {
    compiled: Mutex<Vec<String>>,
    fail_link: bool,
    marker_in_link: bool,
}

impl Toolchain for FakeToolchain {
    fn compile(&self, invocation: &CompileInvocation) -> Result<()> {
        self.compiled.lock().unwrap().push(invocation.exported_symbol.clone());
        fs::write(&invocation.output, invocation.exported_symbol.as_bytes()).unwrap();
        Ok(())
    }

    fn link(&self, invocation: &LinkInvocation) -> Result<()> {
        if self.fail_link {
            return Err(KernelPackError::ToolFailed {
                tool: "ld.lld".to_string(),
                target: invocation.label.clone(),
                code: Some(1),
                stderr: "undefined symbol".to_string(),
            });
        }
        let mut merged = b"\x7fELF".to_vec();
        for object in &invocation.objects {
            merged.extend(fs::read(object).unwrap());
        }
        if self.marker_in_link {
            merged.extend_from_slice(b"g_opSystemRunCfg");
        }
        fs::write(&invocation.output, merged).unwrap();
        Ok(())
    }
}

fn kernel(dir: &Path) -> KernelSource {
    let path = dir.join("add_custom.cpp");
    fs::write(
        &path,
        r#"
extern "C" __global__ __aicore__ void add_custom(GM_ADDR x, GM_ADDR y, GM_ADDR z)
{
    if (TILING_KEY_IS(0)) { run<0>(x, y, z); }
    else if (TILING_KEY_IS(5)) { run<5>(x, y, z); }
    else if (TILING_KEY_IS(12)) { run<12>(x, y, z); }
}
"#,
    )
    .unwrap();
    KernelSource::new(path, "add_custom", "AddCustomKernel")
}

fn config(dir: &Path) -> BuildConfig {
    BuildConfig {
        output_dir: dir.join("build"),
        jobs: 4,
        ..Default::default()
    }
}

#[test]
fn test_mix_build_packs_and_embeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let tools = FakeToolchain::default();
    let target = BuildTarget::new(Architecture::Ascend910B, Channel::Mix).unwrap();

    let output = Pipeline::new(&config, &tools)
        .run(&kernel(dir.path()), &[target])
        .unwrap();

    assert_eq!(tools.compiled.lock().unwrap().len(), 6);
    assert_eq!(output.stats.compiles, 6);
    assert_eq!(output.stats.links, 1);
    assert_eq!(output.artifacts.len(), 1);

    let artifact = &output.artifacts[0];
    let bytes = fs::read(&artifact.container).unwrap();
    let unpacked = unpack(&bytes).unwrap();
    assert_eq!(
        unpacked.kernel_list,
        vec!["add_custom_0", "add_custom_5", "add_custom_12"]
    );
    assert_eq!(unpacked.object, fs::read(&artifact.linked.artifact).unwrap());

    let descriptor = unpacked.to_descriptor().unwrap();
    assert_eq!(descriptor.magic, Magic::Elf);
    assert_eq!(descriptor.core_type, CoreType::Mixed);
    assert_eq!(descriptor.task_ration, TaskRation::ByKey);

    let cpp = fs::read_to_string(&artifact.generated).unwrap();
    assert!(artifact.generated.ends_with("generated/ascend910b/AddCustomKernel.cpp"));
    assert!(cpp.contains("static const uint8_t kernelBin_AddCustomKernel_ascend910b[] = {"));
    assert!(cpp.contains(
        "REG_KERNEL(ascend910b, AddCustomKernel, kernelBin_AddCustomKernel_ascend910b);"
    ));
    assert!(!artifact.mutable);
}

#[test]
fn test_matrix_selects_targets() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let tools = FakeToolchain::default();

    let mut declared = DeclaredMatrix::new();
    declared
        .declare("AddOperation", "AddCustomKernel", "ascend910b", true)
        .declare("AddOperation", "AddCustomKernel", "ascend310p", true)
        .declare("AddOperation", "AddCustomKernel", "ascend310b", true);
    let enabled = BTreeSet::from([Architecture::Ascend910B, Architecture::Ascend310P]);
    let mut reuse = ReuseSet::new();
    reuse.insert("AddCustomKernel", Architecture::Ascend310P);
    let matrix = kernel_packer::resolve(&declared, &enabled, &reuse).unwrap();

    let targets = targets_from_matrix(&matrix, "AddCustomKernel", Channel::Vector).unwrap();
    assert_eq!(
        targets,
        vec![BuildTarget::new(Architecture::Ascend910B, Channel::Vector).unwrap()]
    );

    let output = Pipeline::new(&config, &tools)
        .run(&kernel(dir.path()), &targets)
        .unwrap();
    assert_eq!(output.artifacts.len(), 1);
    assert_eq!(tools.compiled.lock().unwrap().len(), 3);

    let bytes = fs::read(&output.artifacts[0].container).unwrap();
    let descriptor = unpack(&bytes).unwrap().to_descriptor().unwrap();
    assert_eq!(descriptor.magic, Magic::ElfAiVec);
    assert_eq!(descriptor.core_type, CoreType::VectorCore);
}

#[test]
fn test_parallel_targets_each_get_an_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let tools = FakeToolchain {
        marker_in_link: true,
        ..Default::default()
    };
    let targets: Vec<_> = [Architecture::Ascend910, Architecture::Ascend310P, Architecture::Ascend310B]
        .into_iter()
        .map(|arch| BuildTarget::new(arch, Channel::Vector).unwrap())
        .collect();

    let output = Pipeline::new(&config, &tools)
        .with_generated_dir(dir.path().join("cache"))
        .run(&kernel(dir.path()), &targets)
        .unwrap();

    assert_eq!(output.artifacts.len(), 3);
    for artifact in &output.artifacts {
        assert!(artifact.mutable);
        let cpp = fs::read_to_string(&artifact.generated).unwrap();
        assert!(cpp.contains("\nstatic uint8_t kernelBin_AddCustomKernel_"));
        assert!(artifact.generated.starts_with(dir.path().join("cache")));
    }
}

#[test]
fn test_link_failure_leaves_nothing_registered() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let tools = FakeToolchain {
        fail_link: true,
        ..Default::default()
    };
    let target = BuildTarget::new(Architecture::Ascend910B, Channel::Cube).unwrap();

    let err = Pipeline::new(&config, &tools)
        .run(&kernel(dir.path()), &[target])
        .unwrap_err();
    assert!(matches!(err, KernelPackError::ToolFailed { ref tool, .. } if tool == "ld.lld"));
    assert!(err.to_string().contains("AddCustomKernel@ascend910b"));

    let kernel_dir = config.output_dir.join("ascend910b").join("AddCustomKernel");
    assert!(!kernel_dir.join("AddCustomKernel.bin").exists());
    assert!(!config.output_dir.join("generated").exists());
}

#[test]
fn test_channels_sharing_an_architecture_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let tools = FakeToolchain::default();
    let targets = [
        BuildTarget::new(Architecture::Ascend910B, Channel::Vector).unwrap(),
        BuildTarget::new(Architecture::Ascend910B, Channel::Cube).unwrap(),
    ];

    let err = Pipeline::new(&config, &tools)
        .run(&kernel(dir.path()), &targets)
        .unwrap_err();
    assert!(matches!(err, KernelPackError::DuplicateArchitecture { .. }));
    assert!(tools.compiled.lock().unwrap().is_empty());
    assert!(!config.output_dir.join("ascend910b").exists());
}
