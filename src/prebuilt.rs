//! Prebuilt kernel packaging
//!
//! Kernels compiled outside this crate arrive as descriptor/object pairs
//! on disk and are packed and embedded without running the toolchain.
//! Two layouts are understood:
//!
//! ```text
//! <binary_dir>/op_kernels/<arch>/<op>/<tactic>/<name>.json   (+ <name>.o)
//! <kernel_root>/<arch>/<path from the tactic table>.json     (+ .o)
//! ```
//!
//! Every descriptor becomes `<cache_dir>/obj/<arch>/<op>/<name>.cpp`. In
//! the tactic tree the tactic directory is the registered kernel id; in
//! the tactic table it is the entry key.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::embed::{render, write_source, EmbedOptions};
use crate::error::{KernelPackError, Result};
use crate::matrix::ReuseSet;
use crate::pipeline::pack_files;
use crate::target::Architecture;

/// One prebuilt descriptor/object pair carried to generated source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrebuiltKernel {
    pub architecture: Architecture,
    pub operation: String,
    pub kernel_id: String,
    pub descriptor: PathBuf,
    pub object: PathBuf,
    pub generated: PathBuf,
    pub mutable: bool,
}

/// `<cache_dir>/obj/<arch>`
pub fn generated_root(cache_dir: &Path, architecture: Architecture) -> PathBuf {
    cache_dir.join("obj").join(architecture.name())
}

/// Where the fragment for `descriptor` goes: same stem, `.cpp`.
fn generated_path(cache_dir: &Path, architecture: Architecture, operation: &str, descriptor: &Path) -> PathBuf {
    let name = descriptor
        .file_name()
        .map(|n| Path::new(n).with_extension("cpp"))
        .unwrap_or_default();
    generated_root(cache_dir, architecture).join(operation).join(name)
}

struct PrebuiltInput<'a> {
    architecture: Architecture,
    operation: &'a str,
    kernel_id: &'a str,
    descriptor: PathBuf,
}

fn package_one(input: PrebuiltInput<'_>, cache_dir: &Path, options: &EmbedOptions) -> Result<PrebuiltKernel> {
    let object = input.descriptor.with_extension("o");
    if !object.is_file() {
        return Err(KernelPackError::MissingKernelObject {
            descriptor: input.descriptor,
            object,
        });
    }

    let packed = pack_files(&input.descriptor, &object)?;
    let source = render(&packed, input.kernel_id, input.architecture, options)?;
    let generated = generated_path(cache_dir, input.architecture, input.operation, &input.descriptor);
    write_source(&generated, &source)?;

    Ok(PrebuiltKernel {
        architecture: input.architecture,
        operation: input.operation.to_string(),
        kernel_id: input.kernel_id.to_string(),
        descriptor: input.descriptor,
        object,
        generated,
        mutable: source.mutable,
    })
}

fn walk_error(root: &Path, e: walkdir::Error) -> KernelPackError {
    let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
    KernelPackError::io(path, e.into())
}

/// Package every `<op>/<tactic>/*.json` under
/// `<binary_dir>/op_kernels/<arch>/` for each architecture.
///
/// Architectures without a directory contribute nothing. Entries are
/// visited in file-name order so repeated runs write the same files.
pub fn package_tactic_tree(
    binary_dir: &Path,
    architectures: &BTreeSet<Architecture>,
    cache_dir: &Path,
    options: &EmbedOptions,
) -> Result<Vec<PrebuiltKernel>> {
    let mut packaged = Vec::new();

    for &architecture in architectures {
        let root = binary_dir.join("op_kernels").join(architecture.name());
        if !root.is_dir() {
            log::debug!("No tactic tree at {}", root.display());
            continue;
        }

        let before = packaged.len();
        for entry in WalkDir::new(&root).min_depth(3).max_depth(3).sort_by_file_name() {
            let entry = entry.map_err(|e| walk_error(&root, e))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let relative = path.strip_prefix(&root).unwrap_or(path);
            let mut parts = relative.iter().map(|p| p.to_string_lossy().into_owned());
            let (Some(operation), Some(tactic)) = (parts.next(), parts.next()) else {
                continue;
            };

            let input = PrebuiltInput {
                architecture,
                operation: &operation,
                kernel_id: &tactic,
                descriptor: path.to_path_buf(),
            };
            packaged.push(package_one(input, cache_dir, options)?);
        }
        log::info!("{} has {} prebuilt tactic(s)", architecture, packaged.len() - before);
    }
    Ok(packaged)
}

/// One `kernel[.arch] = path.json` line of the tactic table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TacticEntry {
    pub kernel: String,
    /// Architecture name from a `kernel.arch` key.
    pub architecture: Option<String>,
    /// Descriptor path relative to `<kernel_root>/<arch>/`.
    pub descriptor: PathBuf,
}

/// Operation sections of the ini tactic table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TacticTable {
    operations: BTreeMap<String, Vec<TacticEntry>>,
}

impl TacticTable {
    /// Parse ini text: `[Operation]` sections of `kernel = path` lines,
    /// `=` or `:` as delimiter, `#`/`;` comments. Keys keep their case.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let invalid = |line: usize, reason: String| KernelPackError::InvalidConfig {
            path: path.to_path_buf(),
            reason: format!("line {}: {}", line, reason),
        };

        let mut table = Self::default();
        let mut current: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| invalid(line_no, format!("malformed section header '{}'", line)))?;
                table.operations.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let operation = current
                .as_ref()
                .ok_or_else(|| invalid(line_no, "entry before any section".to_string()))?;
            let (key, value) = line
                .find(|c: char| c == '=' || c == ':')
                .map(|at| (line[..at].trim(), line[at + 1..].trim()))
                .ok_or_else(|| invalid(line_no, format!("expected 'kernel = path', got '{}'", line)))?;
            if key.is_empty() || value.is_empty() {
                return Err(invalid(line_no, format!("empty key or path in '{}'", line)));
            }
            if !value.ends_with(".json") {
                return Err(invalid(line_no, format!("'{}' is not a .json descriptor", value)));
            }

            let (kernel, architecture) = match key.split_once('.') {
                Some((kernel, arch)) => (kernel, Some(arch.to_string())),
                None => (key, None),
            };
            table.operations.entry(operation.clone()).or_default().push(TacticEntry {
                kernel: kernel.to_string(),
                architecture,
                descriptor: PathBuf::from(value),
            });
        }
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| KernelPackError::io(path, e))?;
        Self::parse(&text, path)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    /// Entries that apply on `architecture`, as (operation, entry).
    ///
    /// A `kernel.<arch>` entry replaces the plain `kernel` entry of the
    /// same operation on that architecture; overrides for other
    /// architectures are dropped.
    pub fn entries_for(&self, architecture: Architecture) -> Vec<(&str, &TacticEntry)> {
        let name = architecture.name();
        let mut out = Vec::new();
        for (operation, entries) in &self.operations {
            let overridden: BTreeSet<&str> = entries
                .iter()
                .filter(|e| e.architecture.as_deref() == Some(name))
                .map(|e| e.kernel.as_str())
                .collect();
            for entry in entries {
                let applies = match entry.architecture.as_deref() {
                    Some(arch) => arch == name,
                    None => !overridden.contains(entry.kernel.as_str()),
                };
                if applies {
                    out.push((operation.as_str(), entry));
                }
            }
        }
        out
    }

    /// Kernels the table provides on each architecture. These are not
    /// compiled from source.
    pub fn reuse_set(&self, architectures: &BTreeSet<Architecture>) -> ReuseSet {
        let mut reuse = ReuseSet::new();
        for &architecture in architectures {
            for (_, entry) in self.entries_for(architecture) {
                reuse.insert(entry.kernel.clone(), architecture);
            }
        }
        reuse
    }
}

/// Package every tactic-table entry found under `<kernel_root>/<arch>/`.
pub fn package_tactic_table(
    table: &TacticTable,
    kernel_root: &Path,
    architectures: &BTreeSet<Architecture>,
    cache_dir: &Path,
    options: &EmbedOptions,
) -> Result<Vec<PrebuiltKernel>> {
    let mut packaged = Vec::new();
    for &architecture in architectures {
        let arch_root = kernel_root.join(architecture.name());
        for (operation, entry) in table.entries_for(architecture) {
            let input = PrebuiltInput {
                architecture,
                operation,
                kernel_id: &entry.kernel,
                descriptor: arch_root.join(&entry.descriptor),
            };
            packaged.push(package_one(input, cache_dir, options)?);
        }
    }
    log::info!("Packaged {} tactic table kernel(s)", packaged.len());
    Ok(packaged)
}
