//! Per-engine argument builders.
//!
//! Every [`EngineKind`] has exactly one function that turns a stage's
//! parameters and resolved artifact paths into the argument list of a single
//! engine invocation. Invalid parameter combinations are rejected here, before
//! anything is spawned.

mod ffmpeg;
mod params;
mod sox;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mx_core::config::EncodeConfig;
use mx_core::{Error, Result};

use crate::artifacts::ArtifactFormat;

pub use params::{num, ParamValue, StageParams};

/// The DSP capabilities a stage can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Trim, gain, filters, fades, delay, padding, loudness and resampling.
    TrimResample,
    /// Tempo and/or pitch change.
    TimeStretch,
    Reverb,
    /// Multi-tap echo on an attenuated copy.
    Echo,
    /// Weighted mix of two or more inputs.
    Mix,
    /// Peak limiter.
    Limiter,
}

impl EngineKind {
    pub const ALL: [EngineKind; 6] = [
        EngineKind::TrimResample,
        EngineKind::TimeStretch,
        EngineKind::Reverb,
        EngineKind::Echo,
        EngineKind::Mix,
        EngineKind::Limiter,
    ];

    /// The external tool that implements this engine.
    pub fn tool(&self) -> &'static str {
        match self {
            EngineKind::TimeStretch | EngineKind::Reverb => "sox",
            EngineKind::TrimResample
            | EngineKind::Echo
            | EngineKind::Mix
            | EngineKind::Limiter => "ffmpeg",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::TrimResample => "trim-resample",
            EngineKind::TimeStretch => "time-stretch",
            EngineKind::Reverb => "reverb",
            EngineKind::Echo => "echo",
            EngineKind::Mix => "mix",
            EngineKind::Limiter => "limiter",
        }
    }

    /// Minimum and maximum number of inputs.
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            EngineKind::Mix => (2, None),
            _ => (1, Some(1)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully resolved engine command line.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInvocation {
    /// Tool name for [`crate::ToolRegistry::require`].
    pub tool: &'static str,
    pub args: Vec<String>,
}

/// Build the invocation for one stage.
///
/// `inputs` are the ready artifacts in slot order and `output` the path the
/// engine must write in `output_format`.
pub fn build_invocation(
    stage: &str,
    kind: EngineKind,
    params: &StageParams,
    inputs: &[PathBuf],
    output: &Path,
    output_format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<EngineInvocation> {
    check_arity(stage, kind, inputs.len())?;
    if output_format == ArtifactFormat::Raw {
        return Err(Error::invalid_stage(stage, "output needs a concrete audio format"));
    }

    let args = match kind {
        EngineKind::TrimResample => {
            ffmpeg::trim_resample(stage, params, inputs, output, output_format, encode)?
        }
        EngineKind::Echo => ffmpeg::echo(stage, params, inputs, output, output_format, encode)?,
        EngineKind::Mix => ffmpeg::mix(stage, params, inputs, output, output_format, encode)?,
        EngineKind::Limiter => {
            ffmpeg::limiter(stage, params, inputs, output, output_format, encode)?
        }
        EngineKind::TimeStretch => {
            sox::time_stretch(stage, params, &inputs[0], output, output_format, encode)?
        }
        EngineKind::Reverb => sox::reverb(stage, params, &inputs[0], output, output_format, encode)?,
    };

    Ok(EngineInvocation {
        tool: kind.tool(),
        args,
    })
}

fn check_arity(stage: &str, kind: EngineKind, got: usize) -> Result<()> {
    let (min, max) = kind.arity();
    let ok = got >= min && max.map_or(true, |m| got <= m);
    if ok {
        return Ok(());
    }
    let expected = match max {
        Some(m) if m == min => format!("exactly {min}"),
        Some(m) => format!("{min} to {m}"),
        None => format!("at least {min}"),
    };
    Err(Error::invalid_stage(
        stage,
        format!("{kind} expects {expected} input(s), got {got}"),
    ))
}

pub(crate) fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
