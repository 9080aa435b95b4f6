//! Kernel Packer
//!
//! Compiles one device-kernel source into every architecture, channel and
//! specialization variant the build matrix asks for, links the variants
//! into one artifact per architecture, wraps each artifact in a packed
//! container and emits C++ that registers the container with the runtime
//! operator registry. Kernels built elsewhere are packaged from their
//! on-disk trees the same way.
//!
//! ```text
//! matrix::resolve -> build::Orchestrator -> container::pack -> embed::render
//! ```

pub mod build;
pub mod config;
pub mod container;
pub mod descriptor;
pub mod embed;
pub mod error;
pub mod matrix;
pub mod pipeline;
pub mod prebuilt;
pub mod source;
pub mod target;
pub mod validation;

pub use build::{BuildStats, FlagProfile, LinkedArtifact, Orchestrator, ProcessToolchain, Toolchain};
pub use config::BuildConfig;
pub use container::{pack, unpack, UnpackedArtifact};
pub use descriptor::{load_descriptor, CoreType, KernelDescriptor, Magic, TaskRation};
pub use embed::{render, EmbedOptions, GeneratedSource};
pub use error::{KernelPackError, Result};
pub use matrix::{resolve, BuildMatrix, DeclaredMatrix, ReuseSet};
pub use pipeline::{Pipeline, PipelineOutput};
pub use prebuilt::{PrebuiltKernel, TacticTable};
pub use source::KernelSource;
pub use target::{Architecture, BuildTarget, Channel};
