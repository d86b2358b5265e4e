//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for engine tools, pipeline scheduling, output encoding, input
//! admission and metrics. Every section defaults sensibly so a completely
//! empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub pipeline: PipelineConfig,
    pub encode: EncodeConfig,
    pub limits: LimitsConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_parallel_stages == 0 {
            warnings.push("pipeline.max_parallel_stages is 0; stages will run one at a time".into());
        }
        if self.pipeline.stage_timeout_secs == 0 {
            warnings.push("pipeline.stage_timeout_secs is 0; every stage will time out".into());
        }
        if self.pipeline.run_timeout_secs < self.pipeline.stage_timeout_secs {
            warnings.push(
                "pipeline.run_timeout_secs is shorter than stage_timeout_secs; the run deadline wins"
                    .into(),
            );
        }
        if self.pipeline.diagnostic_lines == 0 {
            warnings.push("pipeline.diagnostic_lines is 0; engine failures will carry no output".into());
        }
        if let Some(ref dir) = self.pipeline.scratch_dir {
            if !dir.exists() {
                warnings.push(format!(
                    "pipeline.scratch_dir {} does not exist",
                    dir.display()
                ));
            }
        }

        let valid_rates = [8000, 16000, 22050, 32000, 44100, 48000];
        if !valid_rates.contains(&self.encode.sample_rate) {
            warnings.push(format!(
                "encode.sample_rate {} is unusual for MP3 (expected one of {:?})",
                self.encode.sample_rate, valid_rates
            ));
        }
        if !(1..=2).contains(&self.encode.channels) {
            warnings.push(format!(
                "encode.channels {} is not mono or stereo",
                self.encode.channels
            ));
        }
        if let Some(q) = self.encode.quality {
            if q > 9 {
                warnings.push(format!("encode.quality {q} is outside the VBR range 0-9"));
            }
        }

        if self.limits.max_input_bytes == 0 {
            warnings.push("limits.max_input_bytes is 0; every upload will be rejected".into());
        }
        if self.metrics.capacity == 0 {
            warnings.push("metrics.capacity is 0; no run records will be kept".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Custom paths for the external engines. Unset entries are looked up in
/// `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub sox_path: Option<PathBuf>,
}

/// Scheduling, deadlines and scratch storage for pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on engine subprocesses running at once within one run.
    pub max_parallel_stages: usize,
    /// Budget for a stage that declares none.
    pub stage_timeout_secs: u64,
    /// Budget for a whole run when the caller supplies no deadline.
    pub run_timeout_secs: u64,
    /// Minimum advance of media time between progress reports.
    pub progress_step_secs: u64,
    /// Number of engine output lines kept per stage.
    pub diagnostic_lines: usize,
    /// Maximum size of the diagnostic excerpt attached to an error.
    pub diagnostic_excerpt_bytes: usize,
    /// How long in-flight stages get to wind down after a failure.
    pub cancel_grace_ms: u64,
    /// Root for per-run scratch directories (system temp dir when unset).
    pub scratch_dir: Option<PathBuf>,
    /// Directory of additional preset JSON files.
    pub preset_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 2,
            stage_timeout_secs: 300,
            run_timeout_secs: 900,
            progress_step_secs: 30,
            diagnostic_lines: 32,
            diagnostic_excerpt_bytes: 1024,
            cancel_grace_ms: 2000,
            scratch_dir: None,
            preset_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn progress_step(&self) -> Duration {
        Duration::from_secs(self.progress_step_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Scratch root, resolved against the system temp dir.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Encoding of the terminal MP3 artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    pub codec: String,
    pub bitrate: String,
    pub sample_rate: u32,
    pub channels: u32,
    /// VBR quality (`-q:a`); takes precedence over `bitrate` when set.
    pub quality: Option<u32>,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            codec: "libmp3lame".into(),
            bitrate: "128k".into(),
            sample_rate: 44100,
            channels: 2,
            quality: None,
        }
    }
}

/// Admission rules applied to uploaded inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_input_bytes: u64,
    pub allowed_content_prefix: String,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 50 * 1024 * 1024,
            allowed_content_prefix: "audio/".into(),
        }
    }
}

/// Run metrics retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.pipeline.max_parallel_stages, 2);
        assert_eq!(cfg.pipeline.progress_step(), Duration::from_secs(30));
        assert_eq!(cfg.encode.codec, "libmp3lame");
        assert_eq!(cfg.encode.sample_rate, 44100);
        assert_eq!(cfg.limits.max_input_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.metrics.capacity, 50);
    }

    #[test]
    fn default_config_no_warnings() {
        let cfg = Config::default();
        let warnings = cfg.validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn parse_json_config() {
        let json = r#"{"pipeline": {"max_parallel_stages": 4}, "encode": {"quality": 2}}"#;
        let cfg = Config::from_json(json).unwrap();
        assert_eq!(cfg.pipeline.max_parallel_stages, 4);
        assert_eq!(cfg.pipeline.stage_timeout_secs, 300);
        assert_eq!(cfg.encode.quality, Some(2));
    }

    #[test]
    fn parse_empty_json_uses_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.pipeline.run_timeout_secs, 900);
        assert_eq!(cfg.limits.allowed_content_prefix, "audio/");
    }

    #[test]
    fn parse_invalid_json_is_validation_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_or_default_with_none() {
        let cfg = Config::load_or_default(None);
        assert_eq!(cfg.pipeline.max_parallel_stages, 2);
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/config.json")));
        assert_eq!(cfg.pipeline.max_parallel_stages, 2);
    }

    #[test]
    fn load_or_default_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixdown.json");
        std::fs::write(&path, r#"{"metrics": {"capacity": 10}}"#).unwrap();
        let cfg = Config::load_or_default(Some(&path));
        assert_eq!(cfg.metrics.capacity, 10);
    }

    #[test]
    fn odd_encode_settings_warn() {
        let mut cfg = Config::default();
        cfg.encode.sample_rate = 12345;
        cfg.encode.channels = 6;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("sample_rate")));
        assert!(warnings.iter().any(|w| w.contains("channels")));
    }

    #[test]
    fn run_shorter_than_stage_warns() {
        let mut cfg = Config::default();
        cfg.pipeline.run_timeout_secs = 10;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("run_timeout_secs")));
    }
}
