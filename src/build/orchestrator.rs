//! Variant build orchestration
//!
//! Expands one kernel source into (target, key) variants, compiles them in
//! parallel, and links each target's objects once every compile for it has
//! returned. Any failure trips a shared abort flag so sibling jobs stop
//! before starting new tool runs.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::flags::{compile_args, link_args, variant_defines, CompileFlags};
use super::toolchain::{CompileInvocation, LinkInvocation, Toolchain};
use crate::config::BuildConfig;
use crate::descriptor::{KernelDescriptor, TaskRation};
use crate::error::{KernelPackError, Result};
use crate::source::{variant_symbol, KernelSource};
use crate::target::BuildTarget;

/// Counters for one orchestrator's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildStats {
    pub compiles: usize,
    pub links: usize,
    pub retries: usize,
    pub failures: usize,
    pub total_time_ms: u128,
}

#[derive(Debug, Default)]
struct Counters {
    compiles: AtomicUsize,
    links: AtomicUsize,
    retries: AtomicUsize,
    failures: AtomicUsize,
    total_time_ms: AtomicUsize,
}

/// One linked per-target artifact and the descriptor written beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedArtifact {
    pub kernel_id: String,
    pub target: BuildTarget,
    pub artifact: PathBuf,
    pub descriptor: PathBuf,
    pub kernel_list: Vec<String>,
}

pub struct Orchestrator<'a> {
    config: &'a BuildConfig,
    toolchain: &'a dyn Toolchain,
    abort: Arc<AtomicBool>,
    counters: Counters,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a BuildConfig, toolchain: &'a dyn Toolchain) -> Self {
        Self {
            config,
            toolchain,
            abort: Arc::new(AtomicBool::new(false)),
            counters: Counters::default(),
        }
    }

    /// Share an externally owned abort flag (e.g. one tripped by Ctrl+C).
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn stats(&self) -> BuildStats {
        BuildStats {
            compiles: self.counters.compiles.load(Ordering::Relaxed),
            links: self.counters.links.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            total_time_ms: self.counters.total_time_ms.load(Ordering::Relaxed) as u128,
        }
    }

    /// `<output>/<arch>/<kernel_id>/<kernel_id>.o`
    pub fn artifact_path(&self, source: &KernelSource, target: BuildTarget) -> PathBuf {
        self.config
            .output_dir
            .join(target.architecture.name())
            .join(&source.kernel_id)
            .join(format!("{}.o", source.kernel_id))
    }

    /// Every compiler invocation needed for `target`, key-major.
    pub fn plan(&self, source: &KernelSource, target: BuildTarget, keys: &[u64]) -> Vec<CompileInvocation> {
        let artifact = self.artifact_path(source, target);
        let dir = artifact.parent().map(Path::to_path_buf).unwrap_or_default();
        let tikcpp = self.config.tikcpp_root();
        let profile = self.config.profile();

        let mut invocations = Vec::new();
        for &key in keys {
            for unit in target.compile_units() {
                let (exported, object) = match unit.half {
                    Some(half) => (
                        format!("{}_{}", variant_symbol(&source.symbol, key), half.suffix()),
                        format!("{}_{}_{}.o", source.kernel_id, half.suffix(), key),
                    ),
                    None => (
                        variant_symbol(&source.symbol, key),
                        format!("{}_{}.o", source.kernel_id, key),
                    ),
                };
                let output = dir.join(object);
                let defines = variant_defines(&source.symbol, &exported, key);
                let args = compile_args(&CompileFlags {
                    family: target.family(),
                    profile,
                    tikcpp_root: &tikcpp,
                    defines: &defines,
                    source: &source.path,
                    sub_arch: unit.sub_arch,
                    output: &output,
                });

                invocations.push(CompileInvocation {
                    target,
                    key,
                    half: unit.half,
                    sub_arch: unit.sub_arch,
                    exported_symbol: exported,
                    source: source.path.clone(),
                    output,
                    args,
                });
            }
        }
        invocations
    }

    /// Compile one specialization of `source` for `target`.
    ///
    /// Returns one object path, or two (cube half first) for mix.
    pub fn compile_variant(&self, source: &KernelSource, target: BuildTarget, key: u64) -> Result<Vec<PathBuf>> {
        self.plan(source, target, &[key])
            .iter()
            .map(|invocation| self.compile(invocation))
            .collect()
    }

    /// Run one planned compile.
    pub fn compile(&self, invocation: &CompileInvocation) -> Result<PathBuf> {
        if let Some(parent) = invocation.output.parent() {
            fs::create_dir_all(parent).map_err(|e| KernelPackError::io(parent, e))?;
        }
        let label = invocation.label();
        self.run_job(&label, || self.toolchain.compile(invocation))?;
        self.counters.compiles.fetch_add(1, Ordering::Relaxed);
        Ok(invocation.output.clone())
    }

    /// Link `objects` into `output`. All inputs must already exist.
    pub fn link(&self, objects: &[PathBuf], output: &Path, label: &str) -> Result<()> {
        if let Some(missing) = objects.iter().find(|p| !p.exists()) {
            self.fail();
            return Err(KernelPackError::MissingObject {
                path: missing.clone(),
                target: label.to_string(),
            });
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|e| KernelPackError::io(parent, e))?;
        }

        let invocation = LinkInvocation {
            label: label.to_string(),
            objects: objects.to_vec(),
            output: output.to_path_buf(),
            args: link_args(objects, output),
        };
        self.run_job(label, || self.toolchain.link(&invocation))?;
        self.counters.links.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Compile every key for `target`, link, and write the descriptor.
    pub fn build_target(&self, source: &KernelSource, target: BuildTarget, keys: &[u64]) -> Result<LinkedArtifact> {
        let plan = self.plan(source, target, keys);
        log::debug!("{} for {}: {} compile job(s)", source.kernel_id, target, plan.len());

        // Join barrier: collect returns only after every compile has.
        let objects = plan
            .par_iter()
            .map(|invocation| self.compile(invocation))
            .collect::<Result<Vec<PathBuf>>>()?;

        let artifact = self.artifact_path(source, target);
        let label = format!("{}@{}", source.kernel_id, target.architecture);
        self.link(&objects, &artifact, &label)?;

        let kernel_list: Vec<String> = keys.iter().map(|&k| variant_symbol(&source.symbol, k)).collect();
        let descriptor = self.write_descriptor(target, &artifact, &kernel_list)?;
        log::info!("Linked {} ({} kernel(s))", artifact.display(), kernel_list.len());

        Ok(LinkedArtifact {
            kernel_id: source.kernel_id.clone(),
            target,
            artifact,
            descriptor,
            kernel_list,
        })
    }

    /// Build `source` for every target on a pool of `jobs` workers.
    pub fn build(&self, source: &KernelSource, targets: &[BuildTarget]) -> Result<Vec<LinkedArtifact>> {
        let keys = source.specialization_keys()?;
        self.build_with_keys(source, targets, &keys)
    }

    pub fn build_with_keys(
        &self,
        source: &KernelSource,
        targets: &[BuildTarget],
        keys: &[u64],
    ) -> Result<Vec<LinkedArtifact>> {
        // One artifact per (kernel, architecture): paths carry no channel.
        let mut seen = BTreeSet::new();
        if let Some(dup) = targets.iter().find(|t| !seen.insert(t.architecture)) {
            return Err(KernelPackError::DuplicateArchitecture {
                kernel: source.kernel_id.clone(),
                architecture: dup.architecture.to_string(),
            });
        }

        let start = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs)
            .build()
            .map_err(|e| KernelPackError::WorkerPool(e.to_string()))?;

        let result = pool.install(|| {
            targets
                .par_iter()
                .map(|&target| self.build_target(source, target, keys))
                .collect::<Result<Vec<_>>>()
        });

        self.counters
            .total_time_ms
            .fetch_add(start.elapsed().as_millis() as usize, Ordering::Relaxed);
        result
    }

    fn write_descriptor(&self, target: BuildTarget, artifact: &Path, kernel_list: &[String]) -> Result<PathBuf> {
        let bytes = fs::read(artifact).map_err(|e| KernelPackError::io(artifact, e))?;
        let sha256 = format!("{:x}", Sha256::digest(&bytes));

        let (magic, core_type) = target.identity();
        let descriptor = KernelDescriptor {
            magic,
            core_type,
            op_para_size: 0,
            kernel_list: kernel_list.to_vec(),
            compile_info: serde_json::json!({}),
            intercore_sync: false,
            task_ration: TaskRation::ByKey,
        };
        let stem = artifact
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let json = descriptor.to_json(&stem, &sha256);

        let path = artifact.with_extension("json");
        let text = serde_json::to_string_pretty(&json).map_err(|e| KernelPackError::MalformedDescriptor {
            path: path.clone(),
            source: e,
        })?;
        fs::write(&path, text).map_err(|e| KernelPackError::io(&path, e))?;
        Ok(path)
    }

    /// Run a tool job honoring the abort flag and retry budget.
    fn run_job(&self, label: &str, mut job: impl FnMut() -> Result<()>) -> Result<()> {
        let mut attempt = 0;
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(KernelPackError::Aborted(label.to_string()));
            }
            match job() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{} failed, retrying ({}/{}): {}", label, attempt, self.config.retries, e);
                }
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }
    }

    fn fail(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        self.abort.store(true, Ordering::SeqCst);
    }
}
