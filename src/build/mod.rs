//! Variant compile and link stage

pub mod flags;
pub mod orchestrator;
pub mod toolchain;

pub use flags::{compile_args, link_args, CompileFlags, FlagProfile};
pub use orchestrator::{BuildStats, LinkedArtifact, Orchestrator};
pub use toolchain::{CompileInvocation, LinkInvocation, ProcessToolchain, Toolchain};
