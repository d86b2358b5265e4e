//! Named, data-driven effect graphs.
//!
//! A preset is an [`EffectGraph`] template: its stage parameters may refer to
//! the preset's declared parameters with `{name}`, and callers override those
//! parameters per request. The built-in catalog is embedded JSON; more
//! presets can be loaded from a directory of `*.json` files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mx_av::{build_invocation, ParamValue, StageParams};
use mx_core::config::EncodeConfig;
use mx_core::{Error, GraphError, Result};

use crate::graph::{EffectGraph, StageSpec};

const BUILTIN: &str = include_str!("../presets/builtin.json");

/// One preset definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// Input slots callers must bind.
    pub inputs: Vec<String>,
    /// Terminal slot.
    pub output: String,
    /// Suggested file name for the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Declared parameters and their defaults.
    #[serde(default)]
    pub params: StageParams,
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Deserialize)]
struct PresetFile {
    presets: Vec<Preset>,
}

/// The set of known presets, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PresetCatalog {
    presets: BTreeMap<String, Preset>,
}

impl PresetCatalog {
    /// The presets shipped with the crate.
    pub fn builtin() -> Result<Self> {
        let mut catalog = Self::default();
        catalog.add_json(BUILTIN, "builtin")?;
        Ok(catalog)
    }

    /// Parse a preset document (`{"presets": [...]}`) and add its presets,
    /// replacing existing ones with the same id. Every template is checked
    /// by building it with its defaults, engine parameters included.
    pub fn add_json(&mut self, json: &str, origin: &str) -> Result<usize> {
        let file: PresetFile = serde_json::from_str(json)
            .map_err(|e| Error::Validation(format!("preset file {origin}: {e}")))?;
        let count = file.presets.len();
        for preset in file.presets {
            let inputs = preset.inputs.clone();
            instantiate(&preset, &StageParams::new(), &inputs).map_err(|e| {
                Error::Validation(format!("preset '{}' in {origin} is invalid: {e}", preset.id))
            })?;
            if self.presets.insert(preset.id.clone(), preset).is_some() {
                tracing::debug!("preset from {origin} replaces an existing one");
            }
        }
        Ok(count)
    }

    /// Load every `*.json` file in `dir`. Files that fail to parse are
    /// skipped with a warning.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let json = std::fs::read_to_string(&path)?;
            match self.add_json(&json, &path.display().to_string()) {
                Ok(n) => loaded += n,
                Err(e) => tracing::warn!("skipping {}: {e}", path.display()),
            }
        }
        tracing::info!("loaded {loaded} presets from {}", dir.display());
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Option<&Preset> {
        self.presets.get(id)
    }

    /// All presets, sorted by id.
    pub fn list(&self) -> impl Iterator<Item = &Preset> {
        self.presets.values()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Instantiate a preset as a validated graph.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownPreset`] for an unknown id.
    /// - [`Error::Validation`] for an override the preset does not declare.
    /// - [`Error::InvalidStageSpec`] when a stage's parameters, after
    ///   overrides, would not make a valid engine invocation.
    /// - [`GraphError::UnboundInput`] when a declared input is not supplied,
    ///   [`GraphError::UnexpectedInput`] for an extra one.
    pub fn build(
        &self,
        preset_id: &str,
        overrides: &StageParams,
        input_roles: &[String],
    ) -> Result<EffectGraph> {
        let preset = self
            .get(preset_id)
            .ok_or_else(|| Error::UnknownPreset(preset_id.to_string()))?;
        instantiate(preset, overrides, input_roles)
    }
}

fn instantiate(preset: &Preset, overrides: &StageParams, input_roles: &[String]) -> Result<EffectGraph> {
    if let Some((key, _)) = overrides.iter().find(|(k, _)| preset.params.get(k).is_none()) {
        let known: Vec<&str> = preset.params.iter().map(|(k, _)| k.as_str()).collect();
        return Err(Error::Validation(format!(
            "unknown parameter '{key}' for preset '{}' (expected one of: {})",
            preset.id,
            known.join(", ")
        )));
    }

    if let Some(role) = input_roles.iter().find(|r| !preset.inputs.contains(r)) {
        return Err(GraphError::UnexpectedInput { slot: role.clone() }.into());
    }
    if let Some(slot) = preset.inputs.iter().find(|s| !input_roles.contains(s)) {
        return Err(GraphError::UnboundInput {
            stage: "preset".into(),
            slot: slot.clone(),
        }
        .into());
    }

    let mut values = preset.params.clone();
    for (k, v) in overrides.iter() {
        values.insert(k.clone(), v.clone());
    }

    let mut graph = EffectGraph::new(&preset.id, preset.inputs.iter().cloned(), &preset.output);
    graph.file_name = preset.output_name.clone();
    for template in &preset.stages {
        let mut stage = template.clone();
        for (key, value) in stage.params.iter_mut() {
            *value = substitute(value, &values)
                .map_err(|name| Error::invalid_stage(
                    &template.id,
                    format!("parameter '{key}' refers to undeclared '{{{name}}}'"),
                ))?;
        }
        graph.stages.push(stage);
    }

    graph.validate()?;
    check_engines(&graph)?;
    Ok(graph)
}

/// Build every stage's engine invocation against placeholder paths, so bad
/// parameters surface before any artifact exists or engine runs.
fn check_engines(graph: &EffectGraph) -> Result<()> {
    let encode = EncodeConfig::default();
    for stage in &graph.stages {
        let inputs: Vec<PathBuf> = stage.inputs.iter().map(PathBuf::from).collect();
        build_invocation(
            &stage.id,
            stage.engine,
            &stage.params,
            &inputs,
            Path::new(&stage.output),
            graph.output_format(stage),
            &encode,
        )?;
    }
    Ok(())
}

/// Replace `{name}` references. A value that is exactly one reference takes
/// the referenced value with its type; otherwise references are replaced
/// textually. Returns the first undeclared name on failure.
fn substitute(value: &ParamValue, values: &StageParams) -> std::result::Result<ParamValue, String> {
    let ParamValue::Text(text) = value else {
        return Ok(value.clone());
    };

    if let Some(name) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        if is_ident(name) {
            return values.get(name).cloned().ok_or_else(|| name.to_string());
        }
    }

    let mut result = text.clone();
    for (k, v) in values.iter() {
        result = result.replace(&format!("{{{k}}}"), &v.to_string());
    }
    if let Some(name) = leftover_reference(&result) {
        return Err(name);
    }
    Ok(ParamValue::Text(result))
}

fn is_ident(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn leftover_reference(text: &str) -> Option<String> {
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        if let Some(close) = after.find('}') {
            let name = &after[..close];
            if is_ident(name) {
                return Some(name.to_string());
            }
        }
        rest = after;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mx_av::EngineKind;

    fn roles(r: &[&str]) -> Vec<String> {
        r.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_catalog_loads() {
        let catalog = PresetCatalog::builtin().unwrap();
        let ids: Vec<&str> = catalog.list().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["tempo", "trim", "voiceover", "voiceover-dual-reverb"]);
    }

    #[test]
    fn every_builtin_builds_with_defaults() {
        let catalog = PresetCatalog::builtin().unwrap();
        for preset in catalog.list() {
            let graph = catalog
                .build(&preset.id, &StageParams::new(), &preset.inputs)
                .unwrap();
            assert_eq!(graph.validate(), Ok(()));
        }
    }

    #[test]
    fn whole_reference_keeps_type() {
        let catalog = PresetCatalog::builtin().unwrap();
        let graph = catalog
            .build(
                "voiceover",
                &StageParams::new().with("delay_ms", 1500.0),
                &roles(&["voice_track", "audio_track"]),
            )
            .unwrap();
        let delayed = graph.stage_by_id("voice-delayed").unwrap();
        assert_eq!(delayed.params.get("delay_ms"), Some(&ParamValue::Number(1500.0)));
        let bed = graph.stage_by_id("music-bed").unwrap();
        assert_eq!(bed.params.get("pad_end_ms"), Some(&ParamValue::Number(1500.0)));
    }

    #[test]
    fn embedded_reference_is_textual() {
        let catalog = PresetCatalog::builtin().unwrap();
        let graph = catalog
            .build(
                "voiceover",
                &StageParams::new().with("wet_weight", 0.25),
                &roles(&["voice_track", "audio_track"]),
            )
            .unwrap();
        let mix = graph.stage_by_id("voice-mix").unwrap();
        assert_eq!(mix.params.text("weights").as_deref(), Some("1 0.25"));
        assert_eq!(mix.engine, EngineKind::Mix);
    }

    #[test]
    fn unknown_preset() {
        let catalog = PresetCatalog::builtin().unwrap();
        assert_matches!(
            catalog.build("karaoke", &StageParams::new(), &roles(&["audio_track"])),
            Err(Error::UnknownPreset(id)) if id == "karaoke"
        );
    }

    #[test]
    fn unknown_override_is_validation_error() {
        let catalog = PresetCatalog::builtin().unwrap();
        let err = catalog
            .build("trim", &StageParams::new().with("tempo", 2.0), &roles(&["audio_track"]))
            .unwrap_err();
        assert_matches!(err, Error::Validation(ref msg) if msg.contains("'tempo'"));
    }

    #[test]
    fn missing_input_is_unbound() {
        let catalog = PresetCatalog::builtin().unwrap();
        let err = catalog
            .build("voiceover", &StageParams::new(), &roles(&["voice_track"]))
            .unwrap_err();
        assert_matches!(
            err,
            Error::Graph(GraphError::UnboundInput { ref slot, .. }) if slot == "audio_track"
        );
    }

    #[test]
    fn extra_input_is_unexpected() {
        let catalog = PresetCatalog::builtin().unwrap();
        let err = catalog
            .build("trim", &StageParams::new(), &roles(&["audio_track", "voice_track"]))
            .unwrap_err();
        assert_matches!(err, Error::Graph(GraphError::UnexpectedInput { ref slot }) if slot == "voice_track");
    }

    #[test]
    fn trim_graph_names_its_file() {
        let catalog = PresetCatalog::builtin().unwrap();
        let graph = catalog
            .build("trim", &StageParams::new(), &roles(&["audio_track"]))
            .unwrap();
        assert_eq!(graph.output_file_name(), "trimmed.mp3");
        assert_eq!(graph.stages.len(), 1);
        assert_eq!(graph.stages[0].params.get("duration_secs"), Some(&ParamValue::Number(60.0)));
    }

    #[test]
    fn undeclared_reference_rejects_the_file() {
        let json = r#"{"presets":[{"id":"bad","inputs":["a"],"output":"out","stages":[
            {"id":"s","engine":"limiter","inputs":["a"],"output":"out","params":{"limit":"{nope}"}}]}]}"#;
        let mut catalog = PresetCatalog::default();
        let err = catalog.add_json(json, "test").unwrap_err();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[test]
    fn misspelled_engine_key_rejects_the_file() {
        let json = r#"{"presets":[{"id":"typo","inputs":["a"],"output":"out","stages":[
            {"id":"cut","engine":"trim-resample","inputs":["a"],"output":"cut","params":{"duration_secs":30}},
            {"id":"master","engine":"limiter","inputs":["cut"],"output":"out","params":{"limt":0.9}}]}]}"#;
        let mut catalog = PresetCatalog::default();
        let err = catalog.add_json(json, "test").unwrap_err();
        assert_matches!(err, Error::Validation(ref msg) if msg.contains("'limt'"));
        assert!(catalog.is_empty());
    }

    #[test]
    fn sox_stage_cannot_be_terminal() {
        let json = r#"{"presets":[{"id":"raw","inputs":["a"],"output":"out","stages":[
            {"id":"stretch","engine":"time-stretch","inputs":["a"],"output":"out","params":{"tempo":1.1}}]}]}"#;
        let mut catalog = PresetCatalog::default();
        assert_matches!(catalog.add_json(json, "test"), Err(Error::Validation(_)));
    }

    #[test]
    fn bad_override_fails_at_build_time() {
        let catalog = PresetCatalog::builtin().unwrap();
        let voices = roles(&["voice_track", "audio_track"]);

        let err = catalog
            .build("voiceover", &StageParams::new().with("delay_ms", "soon"), &voices)
            .unwrap_err();
        assert_matches!(err, Error::InvalidStageSpec { ref stage, .. } if stage == "voice-delayed");

        let err = catalog
            .build("voiceover", &StageParams::new().with("bed_fade_secs", 30.0), &voices)
            .unwrap_err();
        assert_matches!(err, Error::InvalidStageSpec { ref stage, .. } if stage == "music-bed");
    }

    #[test]
    fn invalid_graph_rejects_the_file() {
        let json = r#"{"presets":[{"id":"loop","inputs":["a"],"output":"out","stages":[
            {"id":"s","engine":"mix","inputs":["a","out"],"output":"out"}]}]}"#;
        let mut catalog = PresetCatalog::default();
        assert_matches!(catalog.add_json(json, "test"), Err(Error::Validation(_)));
    }

    #[test]
    fn load_dir_adds_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("louder.json"),
            r#"{"presets":[{"id":"louder","inputs":["audio_track"],"output":"out","params":{"gain":3},
               "stages":[{"id":"master","engine":"limiter","inputs":["audio_track"],"output":"out","params":{"gain_db":"{gain}"}}]}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = PresetCatalog::builtin().unwrap();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        let graph = catalog
            .build("louder", &StageParams::new(), &roles(&["audio_track"]))
            .unwrap();
        assert_eq!(graph.output_file_name(), "louder.mp3");
    }
}
