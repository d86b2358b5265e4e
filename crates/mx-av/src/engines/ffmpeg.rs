//! ffmpeg-backed engines: trim/resample, echo, mix and limiter.

use std::path::{Path, PathBuf};

use mx_core::config::EncodeConfig;
use mx_core::{Error, Result};

use super::params::{num, StageParams};
use super::path_arg;
use crate::artifacts::ArtifactFormat;

/// Flags shared by every ffmpeg invocation. `-progress pipe:2` emits
/// `out_time=` markers on stderr.
const COMMON_FLAGS: &[&str] = &["-hide_banner", "-nostdin", "-y", "-progress", "pipe:2", "-nostats"];

fn base_args(inputs: &[PathBuf]) -> Vec<String> {
    let mut args: Vec<String> = COMMON_FLAGS.iter().map(|s| s.to_string()).collect();
    for input in inputs {
        args.push("-i".into());
        args.push(path_arg(input));
    }
    args
}

/// Codec and layout flags followed by the output path.
fn push_output(
    args: &mut Vec<String>,
    stage: &str,
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
    sample_rate: Option<u32>,
    channels: Option<u32>,
) -> Result<()> {
    let rate = sample_rate.unwrap_or(encode.sample_rate).to_string();
    let channels = channels.unwrap_or(encode.channels).to_string();
    match format {
        ArtifactFormat::Wav => {
            args.extend(["-c:a".into(), "pcm_s16le".into()]);
        }
        ArtifactFormat::Mp3 => {
            args.extend(["-c:a".into(), encode.codec.clone()]);
            match encode.quality {
                Some(q) => args.extend(["-q:a".into(), q.to_string()]),
                None => args.extend(["-b:a".into(), encode.bitrate.clone()]),
            }
        }
        ArtifactFormat::Flac => args.extend(["-c:a".into(), "flac".into()]),
        ArtifactFormat::Ogg => args.extend(["-c:a".into(), "libvorbis".into()]),
        ArtifactFormat::Raw => {
            return Err(Error::invalid_stage(stage, "output needs a concrete audio format"))
        }
    }
    args.extend(["-ar".into(), rate, "-ac".into(), channels]);
    args.push(path_arg(output));
    Ok(())
}

fn push_filters(args: &mut Vec<String>, filters: &[String]) {
    if !filters.is_empty() {
        args.push("-af".into());
        args.push(filters.join(","));
    }
}

fn non_negative(stage: &str, key: &str, value: Option<f64>) -> Result<Option<f64>> {
    match value {
        Some(v) if v < 0.0 => Err(Error::invalid_stage(
            stage,
            format!("'{key}' must not be negative, got {}", num(v)),
        )),
        other => Ok(other),
    }
}

fn positive(stage: &str, key: &str, value: Option<f64>) -> Result<Option<f64>> {
    match value {
        Some(v) if v <= 0.0 => Err(Error::invalid_stage(
            stage,
            format!("'{key}' must be positive, got {}", num(v)),
        )),
        other => Ok(other),
    }
}

const TRIM_KEYS: &[&str] = &[
    "start_secs",
    "duration_secs",
    "gain_db",
    "highpass_hz",
    "lowpass_hz",
    "fade_in_secs",
    "fade_out_secs",
    "delay_ms",
    "pad_end_ms",
    "loudness_lufs",
    "sample_rate",
    "channels",
];

/// Trim a window, shape it, and re-encode.
///
/// Filter order: trim, gain, high/low-pass, fades (relative to the trimmed
/// window), leading delay, tail padding, loudness normalization.
pub(super) fn trim_resample(
    stage: &str,
    params: &StageParams,
    inputs: &[PathBuf],
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<Vec<String>> {
    params.ensure_known(stage, TRIM_KEYS)?;

    let start = non_negative(stage, "start_secs", params.number(stage, "start_secs")?)?;
    let duration = positive(stage, "duration_secs", params.number(stage, "duration_secs")?)?;
    let fade_in = non_negative(stage, "fade_in_secs", params.number(stage, "fade_in_secs")?)?;
    let fade_out = non_negative(stage, "fade_out_secs", params.number(stage, "fade_out_secs")?)?;
    let delay_ms = non_negative(stage, "delay_ms", params.number(stage, "delay_ms")?)?;
    let pad_ms = non_negative(stage, "pad_end_ms", params.number(stage, "pad_end_ms")?)?;
    let highpass = positive(stage, "highpass_hz", params.number(stage, "highpass_hz")?)?;
    let lowpass = positive(stage, "lowpass_hz", params.number(stage, "lowpass_hz")?)?;
    let loudness = params.number_in(stage, "loudness_lufs", -70.0, -5.0)?;
    let sample_rate = params.positive_int(stage, "sample_rate")?;
    let channels = params.positive_int(stage, "channels")?;

    for (key, fade) in [("fade_in_secs", fade_in), ("fade_out_secs", fade_out)] {
        if let (Some(f), Some(d)) = (fade, duration) {
            if f > d {
                return Err(Error::invalid_stage(
                    stage,
                    format!("'{key}' ({}s) is longer than the trimmed duration ({}s)", num(f), num(d)),
                ));
            }
        }
    }
    if fade_out.is_some_and(|f| f > 0.0) && duration.is_none() {
        return Err(Error::invalid_stage(stage, "'fade_out_secs' requires 'duration_secs'"));
    }

    let mut filters = Vec::new();
    if start.is_some() || duration.is_some() {
        let mut atrim = format!("atrim=start={}", num(start.unwrap_or(0.0)));
        if let Some(d) = duration {
            atrim.push_str(&format!(":duration={}", num(d)));
        }
        filters.push(atrim);
        filters.push("asetpts=PTS-STARTPTS".into());
    }
    if let Some(g) = params.number(stage, "gain_db")? {
        filters.push(format!("volume={}dB", num(g)));
    }
    if let Some(hz) = highpass {
        filters.push(format!("highpass=f={}", num(hz)));
    }
    if let Some(hz) = lowpass {
        filters.push(format!("lowpass=f={}", num(hz)));
    }
    if let Some(f) = fade_in.filter(|f| *f > 0.0) {
        filters.push(format!("afade=t=in:st=0:d={}", num(f)));
    }
    if let (Some(f), Some(d)) = (fade_out.filter(|f| *f > 0.0), duration) {
        filters.push(format!("afade=t=out:st={}:d={}", num(d - f), num(f)));
    }
    if let Some(ms) = delay_ms.filter(|ms| *ms > 0.0) {
        filters.push(format!("adelay=delays={}:all=1", num(ms)));
    }
    if let Some(ms) = pad_ms.filter(|ms| *ms > 0.0) {
        filters.push(format!("apad=pad_dur={}", num(ms / 1000.0)));
    }
    if let Some(i) = loudness {
        filters.push(format!("loudnorm=I={}", num(i)));
    }

    let mut args = base_args(inputs);
    push_filters(&mut args, &filters);
    push_output(&mut args, stage, output, format, encode, sample_rate, channels)?;
    Ok(args)
}

const ECHO_KEYS: &[&str] = &["gain_db", "in_gain", "out_gain", "delays_ms", "decays", "highpass_hz"];

/// Attenuate, add a multi-tap echo, then optionally high-pass.
pub(super) fn echo(
    stage: &str,
    params: &StageParams,
    inputs: &[PathBuf],
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<Vec<String>> {
    params.ensure_known(stage, ECHO_KEYS)?;

    let in_gain = params.number_in(stage, "in_gain", 0.0, 1.0)?.unwrap_or(0.8);
    let out_gain = params.number_in(stage, "out_gain", 0.0, 1.0)?.unwrap_or(0.9);
    if in_gain == 0.0 || out_gain == 0.0 {
        return Err(Error::invalid_stage(stage, "echo gains must be greater than 0"));
    }
    let delays = params
        .number_list(stage, "delays_ms")?
        .ok_or_else(|| Error::invalid_stage(stage, "'delays_ms' is required"))?;
    let decays = params
        .number_list(stage, "decays")?
        .ok_or_else(|| Error::invalid_stage(stage, "'decays' is required"))?;
    if delays.len() != decays.len() {
        return Err(Error::invalid_stage(
            stage,
            format!(
                "'delays_ms' has {} taps but 'decays' has {}",
                delays.len(),
                decays.len()
            ),
        ));
    }
    if let Some(d) = delays.iter().find(|d| **d <= 0.0 || **d > 90_000.0) {
        return Err(Error::invalid_stage(
            stage,
            format!("echo delay {}ms is outside (0, 90000]", num(*d)),
        ));
    }
    if let Some(d) = decays.iter().find(|d| **d <= 0.0 || **d > 1.0) {
        return Err(Error::invalid_stage(
            stage,
            format!("echo decay {} is outside (0, 1]", num(*d)),
        ));
    }
    let highpass = positive(stage, "highpass_hz", params.number(stage, "highpass_hz")?)?;

    let join = |values: &[f64]| values.iter().map(|v| num(*v)).collect::<Vec<_>>().join("|");

    let mut filters = Vec::new();
    if let Some(g) = params.number(stage, "gain_db")? {
        filters.push(format!("volume={}dB", num(g)));
    }
    filters.push(format!(
        "aecho={}:{}:{}:{}",
        num(in_gain),
        num(out_gain),
        join(delays.as_slice()),
        join(decays.as_slice())
    ));
    if let Some(hz) = highpass {
        filters.push(format!("highpass=f={}", num(hz)));
    }

    let mut args = base_args(inputs);
    push_filters(&mut args, &filters);
    push_output(&mut args, stage, output, format, encode, None, None)?;
    Ok(args)
}

const MIX_KEYS: &[&str] = &["weights", "duration", "normalize", "dropout_secs", "loudness_lufs"];

/// Weighted mix of all inputs.
pub(super) fn mix(
    stage: &str,
    params: &StageParams,
    inputs: &[PathBuf],
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<Vec<String>> {
    params.ensure_known(stage, MIX_KEYS)?;

    let duration = params.text("duration").unwrap_or_else(|| "longest".into());
    if !matches!(duration.as_str(), "longest" | "shortest" | "first") {
        return Err(Error::invalid_stage(
            stage,
            format!("'duration' must be longest, shortest or first, got '{duration}'"),
        ));
    }
    let normalize = params.flag_or(stage, "normalize", true)?;
    let dropout = non_negative(stage, "dropout_secs", params.number(stage, "dropout_secs")?)?;
    let loudness = params.number_in(stage, "loudness_lufs", -70.0, -5.0)?;

    let mut amix = format!(
        "amix=inputs={}:duration={duration}:normalize={}",
        inputs.len(),
        u8::from(normalize)
    );
    if let Some(weights) = params.number_list(stage, "weights")? {
        if weights.len() != inputs.len() {
            return Err(Error::invalid_stage(
                stage,
                format!("{} weights given for {} inputs", weights.len(), inputs.len()),
            ));
        }
        if weights.iter().any(|w| *w < 0.0) {
            return Err(Error::invalid_stage(stage, "mix weights must not be negative"));
        }
        let joined = weights.iter().map(|w| num(*w)).collect::<Vec<_>>().join(" ");
        amix.push_str(&format!(":weights='{joined}'"));
    }
    if let Some(d) = dropout {
        amix.push_str(&format!(":dropout_transition={}", num(d)));
    }

    let labels: String = (0..inputs.len()).map(|i| format!("[{i}:a]")).collect();
    let mut graph = format!("{labels}{amix}");
    if let Some(i) = loudness {
        graph.push_str(&format!(",loudnorm=I={}", num(i)));
    }
    graph.push_str("[out]");

    let mut args = base_args(inputs);
    args.extend(["-filter_complex".into(), graph, "-map".into(), "[out]".into()]);
    push_output(&mut args, stage, output, format, encode, None, None)?;
    Ok(args)
}

const LIMITER_KEYS: &[&str] = &["limit", "attack_ms", "release_ms", "gain_db"];

/// Peak limiter; usually the last stage, so it also carries the final encode.
pub(super) fn limiter(
    stage: &str,
    params: &StageParams,
    inputs: &[PathBuf],
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<Vec<String>> {
    params.ensure_known(stage, LIMITER_KEYS)?;

    let limit = params.number_in(stage, "limit", 0.0625, 1.0)?.unwrap_or(0.95);
    let attack = params.number_in(stage, "attack_ms", 0.1, 80.0)?.unwrap_or(5.0);
    let release = params.number_in(stage, "release_ms", 1.0, 8000.0)?.unwrap_or(50.0);

    let mut filters = Vec::new();
    if let Some(g) = params.number(stage, "gain_db")? {
        filters.push(format!("volume={}dB", num(g)));
    }
    filters.push(format!(
        "alimiter=limit={}:attack={}:release={}:level=disabled",
        num(limit),
        num(attack),
        num(release)
    ));

    let mut args = base_args(inputs);
    push_filters(&mut args, &filters);
    push_output(&mut args, stage, output, format, encode, None, None)?;
    Ok(args)
}
