//! sox-backed engines: time-stretch and reverb.

use std::path::Path;

use mx_core::config::EncodeConfig;
use mx_core::{Error, Result};

use super::params::{num, StageParams};
use super::path_arg;
use crate::artifacts::ArtifactFormat;

/// `sox -S <input> <output options> <output> <effects...>`
fn command_line(
    stage: &str,
    input: &Path,
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
    effects: Vec<String>,
) -> Result<Vec<String>> {
    let mut args = vec!["-S".to_string(), path_arg(input)];
    match format {
        ArtifactFormat::Wav | ArtifactFormat::Flac => args.extend(["-b".into(), "16".into()]),
        ArtifactFormat::Ogg => {}
        ArtifactFormat::Mp3 => {
            return Err(Error::invalid_stage(
                stage,
                "sox stages cannot write mp3; add an ffmpeg stage for the final encode",
            ))
        }
        ArtifactFormat::Raw => {
            return Err(Error::invalid_stage(stage, "output needs a concrete audio format"))
        }
    }
    args.extend([
        "-r".into(),
        encode.sample_rate.to_string(),
        "-c".into(),
        encode.channels.to_string(),
        path_arg(output),
    ]);
    args.extend(effects);
    Ok(args)
}

const STRETCH_KEYS: &[&str] = &["tempo", "pitch_cents"];

/// Change tempo without changing pitch, pitch without changing tempo, or both.
pub(super) fn time_stretch(
    stage: &str,
    params: &StageParams,
    input: &Path,
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<Vec<String>> {
    params.ensure_known(stage, STRETCH_KEYS)?;

    let tempo = params.number(stage, "tempo")?;
    let pitch = params.number_in(stage, "pitch_cents", -2400.0, 2400.0)?;
    if tempo.is_none() && pitch.is_none() {
        return Err(Error::invalid_stage(stage, "needs 'tempo' and/or 'pitch_cents'"));
    }

    let mut effects = Vec::new();
    if let Some(t) = tempo {
        if t <= 0.0 {
            return Err(Error::invalid_stage(
                stage,
                format!("'tempo' must be positive, got {}", num(t)),
            ));
        }
        effects.extend(["tempo".to_string(), num(t)]);
    }
    if let Some(c) = pitch {
        effects.extend(["pitch".to_string(), num(c)]);
    }
    command_line(stage, input, output, format, encode, effects)
}

const REVERB_KEYS: &[&str] = &[
    "reverberance",
    "hf_damping",
    "room_scale",
    "stereo_depth",
    "pre_delay_ms",
    "wet_gain_db",
    "wet_only",
];

/// Freeverb-style reverb.
pub(super) fn reverb(
    stage: &str,
    params: &StageParams,
    input: &Path,
    output: &Path,
    format: ArtifactFormat,
    encode: &EncodeConfig,
) -> Result<Vec<String>> {
    params.ensure_known(stage, REVERB_KEYS)?;

    let percent = |key: &str, default: f64| -> Result<f64> {
        Ok(params.number_in(stage, key, 0.0, 100.0)?.unwrap_or(default))
    };
    let reverberance = percent("reverberance", 50.0)?;
    let hf_damping = percent("hf_damping", 50.0)?;
    let room_scale = percent("room_scale", 100.0)?;
    let stereo_depth = percent("stereo_depth", 100.0)?;
    let pre_delay = params.number_in(stage, "pre_delay_ms", 0.0, 500.0)?.unwrap_or(0.0);
    let wet_gain = params.number_in(stage, "wet_gain_db", -10.0, 10.0)?.unwrap_or(0.0);

    let mut effects = vec!["reverb".to_string()];
    if params.flag_or(stage, "wet_only", false)? {
        effects.push("-w".into());
    }
    effects.extend(
        [reverberance, hf_damping, room_scale, stereo_depth, pre_delay, wet_gain].map(num),
    );
    command_line(stage, input, output, format, encode, effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn tempo_and_pitch() {
        let params = StageParams::new().with("tempo", 1.25).with("pitch_cents", -100.0);
        let args = time_stretch(
            "stretch",
            &params,
            Path::new("/s/in.wav"),
            Path::new("/s/out.wav"),
            ArtifactFormat::Wav,
            &EncodeConfig::default(),
        )
        .unwrap();
        assert_eq!(
            args,
            vec!["-S", "/s/in.wav", "-b", "16", "-r", "44100", "-c", "2", "/s/out.wav", "tempo", "1.25", "pitch", "-100"]
        );
    }

    #[test]
    fn non_positive_tempo_is_rejected() {
        let params = StageParams::new().with("tempo", 0.0);
        let err = time_stretch(
            "stretch",
            &params,
            Path::new("/s/in.wav"),
            Path::new("/s/out.wav"),
            ArtifactFormat::Wav,
            &EncodeConfig::default(),
        )
        .unwrap_err();
        assert_matches!(err, Error::InvalidStageSpec { ref message, .. } if message.contains("positive"));
    }

    #[test]
    fn stretch_needs_something_to_do() {
        assert_matches!(
            time_stretch(
                "stretch",
                &StageParams::new(),
                Path::new("/s/in.wav"),
                Path::new("/s/out.wav"),
                ArtifactFormat::Wav,
                &EncodeConfig::default(),
            ),
            Err(Error::InvalidStageSpec { .. })
        );
    }

    #[test]
    fn sox_cannot_write_mp3() {
        let params = StageParams::new().with("tempo", 1.1);
        let err = time_stretch(
            "stretch",
            &params,
            Path::new("/s/in.wav"),
            Path::new("/s/out.mp3"),
            ArtifactFormat::Mp3,
            &EncodeConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot write mp3"));
    }

    #[test]
    fn reverb_defaults_and_wet_only() {
        let params = StageParams::new().with("wet_only", true).with("reverberance", 70.0);
        let args = reverb(
            "voice-verb",
            &params,
            Path::new("/s/in.wav"),
            Path::new("/s/out.wav"),
            ArtifactFormat::Wav,
            &EncodeConfig::default(),
        )
        .unwrap();
        let tail: Vec<&str> = args.iter().skip(9).map(String::as_str).collect();
        assert_eq!(tail, vec!["reverb", "-w", "70", "50", "100", "100", "0", "0"]);
    }

    #[test]
    fn reverb_range_checked() {
        let params = StageParams::new().with("room_scale", 150.0);
        assert_matches!(
            reverb(
                "verb",
                &params,
                Path::new("/s/in.wav"),
                Path::new("/s/out.wav"),
                ArtifactFormat::Wav,
                &EncodeConfig::default(),
            ),
            Err(Error::InvalidStageSpec { .. })
        );
    }
}
