//! Build matrix resolution
//!
//! Decides per (operation, kernel, architecture) whether this pipeline
//! compiles the kernel. Inputs are the declared operator map
//! (`op_list.yaml`), the globally enabled architectures and a reuse set of
//! kernels an alternate source already provides.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{KernelPackError, Result};
use crate::target::Architecture;

type RawOperations = BTreeMap<String, Option<BTreeMap<String, Option<BTreeMap<String, Value>>>>>;

/// Declared availability: operation -> kernel -> architecture -> value.
///
/// Values are kept raw until [`resolve`] so a non-boolean can be reported
/// with the operation it appeared under.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeclaredMatrix {
    operations: BTreeMap<String, BTreeMap<String, BTreeMap<String, Value>>>,
}

impl DeclaredMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the operator map from YAML.
    ///
    /// An operation mapped to nothing (`FooOperation:` or `{}`) is host-only.
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self> {
        let raw: Option<RawOperations> =
            serde_yaml::from_str(text).map_err(|e| KernelPackError::InvalidConfig {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let operations = raw
            .unwrap_or_default()
            .into_iter()
            .map(|(op, kernels)| {
                let kernels = kernels
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(kernel, archs)| (kernel, archs.unwrap_or_default()))
                    .collect();
                (op, kernels)
            })
            .collect();
        Ok(Self { operations })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| KernelPackError::io(path, e))?;
        Self::from_yaml(&text, path)
    }

    /// Record `operation/kernel` as declared on `architecture`.
    pub fn declare(
        &mut self,
        operation: &str,
        kernel: &str,
        architecture: &str,
        available: impl Into<Value>,
    ) -> &mut Self {
        self.operations
            .entry(operation.to_string())
            .or_default()
            .entry(kernel.to_string())
            .or_default()
            .insert(architecture.to_string(), available.into());
        self
    }

    /// Record an operation with no device kernels.
    pub fn host_only(&mut self, operation: &str) -> &mut Self {
        self.operations.entry(operation.to_string()).or_default();
        self
    }
}

/// (kernel, architecture) pairs built elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReuseSet {
    pairs: BTreeSet<(String, Architecture)>,
}

#[derive(Deserialize)]
struct ReuseEntry {
    kernel: String,
    architecture: String,
}

impl ReuseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kernel: impl Into<String>, architecture: Architecture) {
        self.pairs.insert((kernel.into(), architecture));
    }

    pub fn contains(&self, kernel: &str, architecture: Architecture) -> bool {
        self.pairs.contains(&(kernel.to_string(), architecture))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Add every pair of `other`.
    pub fn extend(&mut self, other: ReuseSet) {
        self.pairs.extend(other.pairs);
    }

    /// Parse `[{"kernel": "...", "architecture": "..."}, ...]`.
    pub fn from_json(text: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| KernelPackError::InvalidConfig {
            path: path.to_path_buf(),
            reason,
        };
        let entries: Vec<ReuseEntry> = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let mut set = Self::new();
        for entry in entries {
            let arch = entry
                .architecture
                .parse()
                .map_err(|e: KernelPackError| invalid(e.to_string()))?;
            set.insert(entry.kernel, arch);
        }
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| KernelPackError::io(path, e))?;
        Self::from_json(&text, path)
    }
}

/// One resolved build decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMatrixEntry {
    pub operation: String,
    pub kernel: String,
    pub architecture: Architecture,
    pub build: bool,
}

/// Resolved build decisions for every declared entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildMatrix {
    operations: Vec<String>,
    host_only: BTreeSet<String>,
    entries: Vec<BuildMatrixEntry>,
}

impl BuildMatrix {
    pub fn entries(&self) -> &[BuildMatrixEntry] {
        &self.entries
    }

    /// Decision for one entry; `None` when it was never declared.
    pub fn get(&self, operation: &str, kernel: &str, architecture: Architecture) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.operation == operation && e.kernel == kernel && e.architecture == architecture)
            .map(|e| e.build)
    }

    pub fn should_build(&self, operation: &str, kernel: &str, architecture: Architecture) -> bool {
        self.get(operation, kernel, architecture).unwrap_or(false)
    }

    pub fn is_host_only(&self, operation: &str) -> bool {
        self.host_only.contains(operation)
    }

    /// Host-only operations are always present; others need one built kernel.
    pub fn operation_enabled(&self, operation: &str) -> bool {
        self.is_host_only(operation)
            || self
                .entries
                .iter()
                .any(|e| e.operation == operation && e.build)
    }

    /// Architectures `kernel` must be compiled for, across all operations.
    pub fn architectures_to_build(&self, kernel: &str) -> BTreeSet<Architecture> {
        self.entries
            .iter()
            .filter(|e| e.kernel == kernel && e.build)
            .map(|e| e.architecture)
            .collect()
    }

    /// CMake `set(...)` lines, one per entry plus one per operation.
    pub fn to_cmake_options(&self) -> String {
        let switch = |on: bool| if on { "ON" } else { "OFF" };
        let mut out = String::new();
        for op in &self.operations {
            for entry in self.entries.iter().filter(|e| &e.operation == op) {
                let _ = writeln!(
                    out,
                    "set(BUILD_{}_{}_{} {})",
                    entry.operation,
                    entry.kernel,
                    entry.architecture,
                    switch(entry.build)
                );
            }
            let _ = writeln!(out, "set(BUILD_{} {})", op, switch(self.operation_enabled(op)));
        }
        out
    }
}

fn render_value(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

/// Resolve the matrix: `build = declared && enabled && !reused`.
pub fn resolve(declared: &DeclaredMatrix, enabled: &BTreeSet<Architecture>, reuse: &ReuseSet) -> Result<BuildMatrix> {
    let mut matrix = BuildMatrix::default();

    for (operation, kernels) in &declared.operations {
        matrix.operations.push(operation.clone());
        if kernels.is_empty() {
            log::debug!("{} is host-only", operation);
            matrix.host_only.insert(operation.clone());
            continue;
        }

        for (kernel, availability) in kernels {
            for (arch_name, value) in availability {
                let architecture: Architecture =
                    arch_name.parse().map_err(|_| KernelPackError::InvalidMatrix {
                        operation: operation.clone(),
                        reason: format!("invalid architecture '{}' for kernel {}", arch_name, kernel),
                    })?;
                let declared_on = value.as_bool().ok_or_else(|| KernelPackError::InvalidMatrix {
                    operation: operation.clone(),
                    reason: format!(
                        "{} for kernel {} on {} is not a boolean",
                        render_value(value),
                        kernel,
                        arch_name
                    ),
                })?;

                let is_enabled = enabled.contains(&architecture);
                let reused = reuse.contains(kernel, architecture);
                let build = declared_on && is_enabled && !reused;
                if declared_on && !build {
                    log::debug!(
                        "{}/{} on {} skipped ({})",
                        operation,
                        kernel,
                        architecture,
                        if reused { "reused" } else { "not enabled" }
                    );
                }

                matrix.entries.push(BuildMatrixEntry {
                    operation: operation.clone(),
                    kernel: kernel.clone(),
                    architecture,
                    build,
                });
            }
        }
    }

    Ok(matrix)
}
