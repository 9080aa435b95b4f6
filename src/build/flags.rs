//! Compiler and linker command lines
//!
//! One function per flag family. Debug and sanitizer profiles compose
//! with any family.

use std::path::{Path, PathBuf};

use crate::target::FlagFamily;

/// Optional switches layered over the family flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagProfile {
    /// `-O0 -g`, always-inline ignored.
    pub debug: bool,
    /// Long-call and jump-expansion instrumentation.
    pub sanitizer: bool,
    pub suppress_warnings: bool,
}

/// Inputs for a single device compile.
#[derive(Debug, Clone)]
pub struct CompileFlags<'a> {
    pub family: FlagFamily,
    pub profile: FlagProfile,
    pub tikcpp_root: &'a Path,
    pub defines: &'a [String],
    pub source: &'a Path,
    pub sub_arch: &'a str,
    pub output: &'a Path,
}

fn mllvm(out: &mut Vec<String>, option: &str) {
    out.push("-mllvm".to_string());
    out.push(option.to_string());
}

/// Language, include and warning options shared by every family.
pub fn common_options(tikcpp_root: &Path, suppress_warnings: bool) -> Vec<String> {
    let include = |p: PathBuf| format!("-I{}", p.display());
    let mut options = vec![
        "-x".to_string(),
        "cce".to_string(),
        "-I.".to_string(),
        include(tikcpp_root.to_path_buf()),
        include(tikcpp_root.join("tikcfw")),
        include(tikcpp_root.join("tikcfw").join("impl")),
        include(tikcpp_root.join("tikcfw").join("interface")),
    ];
    if suppress_warnings {
        options.push("-Wno-deprecated-declarations".to_string());
        options.push("-Wno-array-bounds".to_string());
    }
    options
}

/// Full compiler argument list (program name excluded).
pub fn compile_args(flags: &CompileFlags<'_>) -> Vec<String> {
    let mut args = vec!["-c".to_string()];

    if flags.profile.debug {
        args.extend(["-O0", "-g", "--cce-ignore-always-inline=true"].map(String::from));
    } else {
        let level = match flags.family {
            FlagFamily::Legacy => "-O2",
            FlagFamily::Extended | FlagFamily::Vectorized => "-O3",
        };
        args.push(level.to_string());
    }

    args.extend(common_options(flags.tikcpp_root, flags.profile.suppress_warnings));
    args.extend(flags.defines.iter().cloned());
    args.push(flags.source.display().to_string());
    args.push(format!("--cce-aicore-arch={}", flags.sub_arch));
    args.push("--cce-aicore-only".to_string());
    args.push("-o".to_string());
    args.push(flags.output.display().to_string());

    match flags.family {
        FlagFamily::Legacy => {
            mllvm(&mut args, "-cce-aicore-fp-ceiling=2");
        }
        FlagFamily::Extended => {
            mllvm(&mut args, "-cce-aicore-stack-size=0x8000");
            mllvm(&mut args, "-cce-aicore-function-stack-size=0x8000");
            mllvm(&mut args, "-cce-aicore-record-overflow=true");
            mllvm(&mut args, "-cce-aicore-addr-transform");
            mllvm(&mut args, "-cce-aicore-dcci-insert-for-scalar=false");
        }
        FlagFamily::Vectorized => {
            mllvm(&mut args, "-cce-aicore-function-stack-size=16000");
            mllvm(&mut args, "-cce-aicore-addr-transform");
            mllvm(&mut args, "--cce-aicore-or-combine=false");
            mllvm(&mut args, "-instcombine-code-sinking=false");
            args.push("-Xclang".to_string());
            args.push("-fcce-vf-vl=256".to_string());
            mllvm(&mut args, "-cce-aicore-jump-expand=false");
            mllvm(&mut args, "-cce-aicore-mask-opt=false");
        }
    }

    if flags.profile.sanitizer {
        args.push("-g".to_string());
        args.push("--cce-enable-sanitizer".to_string());
        mllvm(&mut args, "-cce-aicore-long-call");
        mllvm(&mut args, "-cce-aicore-jump-expand=true");
    }

    args.push("-std=c++17".to_string());
    if flags.family == FlagFamily::Legacy {
        args.push("--cce-mask-opt".to_string());
    }
    args
}

/// Macro definitions for one variant: the symbol redefinition and the
/// key the kernel body switches on.
pub fn variant_defines(symbol: &str, exported: &str, key: u64) -> Vec<String> {
    vec![
        format!("-D{}={}", symbol, exported),
        format!("-DTILING_KEY_VAR={}", key),
    ]
}

/// Full linker argument list (program name excluded).
pub fn link_args(objects: &[PathBuf], output: &Path) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        "aicorelinux".to_string(),
        "-Ttext=0".to_string(),
    ];
    args.extend(objects.iter().map(|p| p.display().to_string()));
    args.push("-static".to_string());
    args.push("-o".to_string());
    args.push(output.display().to_string());
    args
}
