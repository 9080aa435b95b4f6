//! Build targets
//!
//! Maps an architecture and a channel to the compiler sub-architecture(s)
//! and the flag family used to compile for it.

use std::fmt;
use std::str::FromStr;

use crate::descriptor::{CoreType, Magic};
use crate::error::{KernelPackError, Result};

/// Known device architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Architecture {
    Ascend910,
    Ascend310P,
    Ascend910B,
    Ascend310B,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [
        Architecture::Ascend910,
        Architecture::Ascend310P,
        Architecture::Ascend910B,
        Architecture::Ascend310B,
    ];

    /// Name used in build files, directory names and registration statements.
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Ascend910 => "ascend910",
            Architecture::Ascend310P => "ascend310p",
            Architecture::Ascend910B => "ascend910b",
            Architecture::Ascend310B => "ascend310b",
        }
    }

    pub fn family(self) -> FlagFamily {
        match self {
            Architecture::Ascend910 | Architecture::Ascend310P => FlagFamily::Legacy,
            Architecture::Ascend910B => FlagFamily::Extended,
            Architecture::Ascend310B => FlagFamily::Vectorized,
        }
    }

    /// Sub-architecture for a single-unit channel.
    ///
    /// Returns `None` for the mix channel; mix is split into halves by
    /// [`BuildTarget::compile_units`].
    fn sub_arch(self, channel: Channel) -> Option<&'static str> {
        match (self, channel) {
            (Architecture::Ascend910, Channel::Vector | Channel::Cube) => Some("dav-c100"),
            (Architecture::Ascend310P, Channel::Vector | Channel::Cube) => Some("dav-m200"),
            (Architecture::Ascend310B, Channel::Vector | Channel::Cube) => Some("dav-m300"),
            (Architecture::Ascend910B, Channel::Vector) => Some("dav-c220-vec"),
            (Architecture::Ascend910B, Channel::Cube) => Some("dav-c220-cube"),
            (_, Channel::Mix) => None,
        }
    }

    fn supports_mix(self) -> bool {
        matches!(self, Architecture::Ascend910B)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = KernelPackError;

    fn from_str(s: &str) -> Result<Self> {
        Architecture::ALL
            .into_iter()
            .find(|arch| arch.name() == s)
            .ok_or_else(|| KernelPackError::UnknownArchitecture(s.to_string()))
    }
}

/// Execution-unit family a kernel variant targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Vector,
    Cube,
    Mix,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::Vector => "vector",
            Channel::Cube => "cube",
            Channel::Mix => "mix",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = KernelPackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vector" => Ok(Channel::Vector),
            "cube" => Ok(Channel::Cube),
            "mix" | "mixed" => Ok(Channel::Mix),
            other => Err(KernelPackError::UnknownChannel(other.to_string())),
        }
    }
}

/// Compiler flag family, selected by architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagFamily {
    /// Conservative optimization, no stack instrumentation.
    Legacy,
    /// Higher optimization with stack limits and overflow recording.
    Extended,
    /// Extended-like with a fixed vector width and combining passes off.
    Vectorized,
}

/// One half of a mix-channel build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixHalf {
    Cube,
    Vector,
}

impl MixHalf {
    /// Suffix appended to both the object name and the redefined symbol.
    pub fn suffix(self) -> &'static str {
        match self {
            MixHalf::Cube => "mix_cube",
            MixHalf::Vector => "mix_vector",
        }
    }
}

/// A single compiler invocation's worth of target: one sub-architecture,
/// plus the mix half it produces when the channel is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileUnit {
    pub sub_arch: &'static str,
    pub half: Option<MixHalf>,
}

/// Architecture and channel a kernel is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildTarget {
    pub architecture: Architecture,
    pub channel: Channel,
}

impl BuildTarget {
    /// Validates that the architecture has a mapping for the channel.
    pub fn new(architecture: Architecture, channel: Channel) -> Result<Self> {
        let mapped = match channel {
            Channel::Mix => architecture.supports_mix(),
            _ => architecture.sub_arch(channel).is_some(),
        };
        if !mapped {
            return Err(KernelPackError::UnsupportedChannel {
                architecture: architecture.name().to_string(),
                channel: channel.name().to_string(),
            });
        }
        Ok(Self {
            architecture,
            channel,
        })
    }

    pub fn family(&self) -> FlagFamily {
        self.architecture.family()
    }

    /// Compiler invocations needed per specialization key.
    ///
    /// Mix yields two units (cube half first), every other channel one.
    pub fn compile_units(&self) -> Vec<CompileUnit> {
        match self.architecture.sub_arch(self.channel) {
            Some(sub_arch) => vec![CompileUnit {
                sub_arch,
                half: None,
            }],
            None => vec![
                CompileUnit {
                    sub_arch: "dav-c220-cube",
                    half: Some(MixHalf::Cube),
                },
                CompileUnit {
                    sub_arch: "dav-c220-vec",
                    half: Some(MixHalf::Vector),
                },
            ],
        }
    }

    /// Magic and core type the runtime expects for artifacts of this target.
    pub fn identity(&self) -> (Magic, CoreType) {
        if self.family() == FlagFamily::Legacy {
            return (Magic::Elf, CoreType::ComputeCore);
        }
        match self.channel {
            Channel::Cube => (Magic::ElfAiCube, CoreType::ComputeCore),
            Channel::Vector => (Magic::ElfAiVec, CoreType::VectorCore),
            Channel::Mix => (Magic::Elf, CoreType::Mixed),
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.architecture, self.channel)
    }
}
