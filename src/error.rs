//! Error types for kernel packaging
//!
//! Every failure is fatal to the current build run. Variants carry the
//! kernel, architecture or file they concern so the single log line the
//! binary prints is enough to find the root cause.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced anywhere in the build/pack/embed pipeline.
#[derive(Debug, Error)]
pub enum KernelPackError {
    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------
    /// Architecture name not in the known table.
    #[error("unknown architecture '{0}'")]
    UnknownArchitecture(String),

    /// Channel name other than vector/cube/mix.
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    /// Architecture exists but has no sub-architecture for the channel.
    #[error("architecture {architecture} does not support channel {channel}")]
    UnsupportedChannel {
        architecture: String,
        channel: String,
    },

    /// Task ration that is neither the tiling-key sentinel nor "M:N".
    #[error("invalid task ration '{0}': expected \"tilingKey\" or two colon-separated integers")]
    InvalidTaskRation(String),

    /// Core type name or code not in the mapping.
    #[error("invalid core type '{0}'")]
    InvalidCoreType(String),

    /// Magic name or code not in the allowed set.
    #[error("invalid magic '{0}'")]
    InvalidMagic(String),

    /// intercoreSync other than 0 or 1.
    #[error("invalid intercoreSync {0}: expected 0 or 1")]
    InvalidIntercoreSync(u32),

    /// Specialization key marker whose argument does not fit in u64.
    #[error("invalid specialization key '{key}' in {path}")]
    InvalidSpecializationKey { path: PathBuf, key: String },

    /// Build matrix rejected an operator entry.
    #[error("operation {operation}: {reason}")]
    InvalidMatrix { operation: String, reason: String },

    /// A configuration file could not be interpreted.
    #[error("configuration {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    /// Two targets of one run share an architecture and so an artifact path.
    #[error("{kernel} lists architecture {architecture} more than once")]
    DuplicateArchitecture { kernel: String, architecture: String },

    /// Worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    // ---------------------------------------------------------------------
    // Descriptor
    // ---------------------------------------------------------------------
    /// Descriptor file does not exist.
    #[error("descriptor not found: {}", path.display())]
    DescriptorNotFound { path: PathBuf },

    /// Descriptor is not valid JSON or a field has the wrong type.
    #[error("malformed descriptor {}: {source}", path.display())]
    MalformedDescriptor {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Required key absent from the descriptor.
    #[error("descriptor {} is missing required key '{key}'", path.display())]
    MissingKey { path: PathBuf, key: &'static str },

    /// Descriptor declares no kernels.
    #[error("descriptor {} has an empty kernel list", path.display())]
    EmptyKernelList { path: PathBuf },

    /// Descriptor field failed validation.
    #[error("invalid descriptor {}: {source}", path.display())]
    InvalidDescriptor {
        path: PathBuf,
        #[source]
        source: Box<KernelPackError>,
    },

    // ---------------------------------------------------------------------
    // External tools
    // ---------------------------------------------------------------------
    /// The compiler or linker could not be started at all.
    #[error("failed to run {tool} for {target}: {source}")]
    ToolSpawn {
        tool: String,
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// The compiler or linker exited non-zero.
    #[error("{tool} failed for {target} (exit code {code:?}):\n{stderr}")]
    ToolFailed {
        tool: String,
        target: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A tool reported success but its output file is absent.
    #[error("expected output {} was not produced", path.display())]
    MissingOutput { path: PathBuf },

    /// A prebuilt descriptor has no object file beside it.
    #[error("descriptor {} has no object file {}", descriptor.display(), object.display())]
    MissingKernelObject { descriptor: PathBuf, object: PathBuf },

    /// A link input is missing before the linker is invoked.
    #[error("link input {} for {target} does not exist", path.display())]
    MissingObject { path: PathBuf, target: String },

    /// Another job failed or the run was interrupted.
    #[error("build aborted before {0}")]
    Aborted(String),

    // ---------------------------------------------------------------------
    // Container
    // ---------------------------------------------------------------------
    /// Packed blob ended before a field could be read.
    #[error("container truncated at offset {offset}: need {needed} bytes, have {len}")]
    Truncated {
        offset: usize,
        needed: usize,
        len: usize,
    },

    /// Header offsets disagree with the variable section.
    #[error("inconsistent container: {0}")]
    InconsistentContainer(String),

    /// Header version this crate cannot read.
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u32),

    /// A string table entry is not UTF-8.
    #[error("container {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    /// A length does not fit in a 32-bit header word.
    #[error("{field} length {len} does not fit in 32 bits")]
    FieldTooLarge { field: &'static str, len: usize },

    /// Two packs of the same input differed.
    #[error("non-deterministic pack for {0}")]
    NonDeterministic(String),

    // ---------------------------------------------------------------------
    // IO
    // ---------------------------------------------------------------------
    /// Reading or writing a file failed.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl KernelPackError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KernelPackError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures a rerun of the same tool might not repeat.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KernelPackError::ToolFailed { .. })
    }
}

/// Result type for kernel packaging operations.
pub type Result<T> = std::result::Result<T, KernelPackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_culprit() {
        let err = KernelPackError::MissingKey {
            path: PathBuf::from("/tmp/add.json"),
            key: "magic",
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/add.json"));
        assert!(msg.contains("magic"));

        let err = KernelPackError::UnsupportedChannel {
            architecture: "ascend910".to_string(),
            channel: "mix".to_string(),
        };
        assert_eq!(err.to_string(), "architecture ascend910 does not support channel mix");
    }

    #[test]
    fn test_only_tool_failures_retry() {
        let failed = KernelPackError::ToolFailed {
            tool: "ccec".to_string(),
            target: "add_0".to_string(),
            code: Some(1),
            stderr: String::new(),
        };
        assert!(failed.is_retryable());
        assert!(!KernelPackError::MissingOutput { path: PathBuf::from("a.o") }.is_retryable());
        assert!(!KernelPackError::Aborted("add_0".to_string()).is_retryable());
    }
}
