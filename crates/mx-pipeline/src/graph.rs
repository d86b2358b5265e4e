//! The effect graph: stages wired together by named slots.
//!
//! A slot is either one of the graph's external inputs or the output of
//! exactly one stage. Stages name the slots they read, so edges are implied
//! by slot names rather than stored.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mx_av::{ArtifactFormat, EngineKind, ParamValue, StageParams};
use mx_core::GraphError;

/// One DSP step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub engine: EngineKind,
    /// Slots read, in the order the engine receives them.
    pub inputs: Vec<String>,
    /// Slot written.
    pub output: String,
    #[serde(default, skip_serializing_if = "StageParams::is_empty")]
    pub params: StageParams,
    /// Time budget for this stage; the runner's default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_secs: Option<u64>,
}

impl StageSpec {
    pub fn new(
        id: impl Into<String>,
        engine: EngineKind,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            engine,
            inputs: inputs.into_iter().map(Into::into).collect(),
            output: output.into(),
            params: StageParams::new(),
            budget_secs: None,
        }
    }

    /// Builder: set one parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Builder: set the time budget.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget_secs = Some(budget.as_secs().max(1));
        self
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget_secs.map(Duration::from_secs)
    }
}

/// A directed acyclic graph of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectGraph {
    /// Usually the preset id; names the final file.
    pub name: String,
    /// External input slots, bound to uploaded artifacts.
    pub inputs: Vec<String>,
    pub stages: Vec<StageSpec>,
    /// Slot holding the final output.
    pub terminal: String,
    /// Suggested name for the delivered file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl EffectGraph {
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        terminal: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            stages: Vec::new(),
            terminal: terminal.into(),
            file_name: None,
        }
    }

    /// Builder: set the delivered file name.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Delivered file name, `<name>.mp3` unless set.
    pub fn output_file_name(&self) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| format!("{}.mp3", self.name))
    }

    /// Builder: append a stage.
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Check every structural invariant. Nothing may run unless this passes.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.stages.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut ids = HashSet::new();
        for stage in &self.stages {
            if !ids.insert(stage.id.as_str()) {
                return Err(GraphError::DuplicateStage(stage.id.clone()));
            }
        }

        let mut produced: HashSet<&str> = HashSet::new();
        for slot in &self.inputs {
            if !produced.insert(slot.as_str()) {
                return Err(GraphError::DuplicateProducer { slot: slot.clone() });
            }
        }
        for stage in &self.stages {
            if !produced.insert(stage.output.as_str()) {
                return Err(GraphError::DuplicateProducer {
                    slot: stage.output.clone(),
                });
            }
        }

        for stage in &self.stages {
            if let Some(slot) = stage.inputs.iter().find(|s| !produced.contains(s.as_str())) {
                return Err(GraphError::UnboundInput {
                    stage: stage.id.clone(),
                    slot: slot.clone(),
                });
            }
        }

        if self.producer_of(&self.terminal).is_none() {
            return Err(GraphError::MissingTerminal {
                slot: self.terminal.clone(),
            });
        }

        self.topological_order()?;

        let consumed: HashSet<&str> = self
            .stages
            .iter()
            .flat_map(|s| s.inputs.iter().map(String::as_str))
            .collect();
        let dangling = self
            .inputs
            .iter()
            .chain(self.stages.iter().map(|s| &s.output))
            .find(|slot| **slot != self.terminal && !consumed.contains(slot.as_str()));
        if let Some(slot) = dangling {
            return Err(GraphError::DanglingOutput { slot: slot.clone() });
        }

        Ok(())
    }

    /// Index of the stage producing `slot`, if any.
    pub fn producer_of(&self, slot: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.output == slot)
    }

    pub fn stage_by_id(&self, id: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn is_external(&self, slot: &str) -> bool {
        self.inputs.iter().any(|s| s == slot)
    }

    /// Container a stage writes: MP3 for the terminal output, WAV for
    /// everything in between.
    pub fn output_format(&self, stage: &StageSpec) -> ArtifactFormat {
        if stage.output == self.terminal {
            ArtifactFormat::Mp3
        } else {
            ArtifactFormat::Wav
        }
    }

    /// For each stage, the indices of the stages it depends on (deduplicated,
    /// ascending).
    pub fn dependencies(&self) -> Vec<Vec<usize>> {
        let producers: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.output.as_str(), i))
            .collect();
        self.stages
            .iter()
            .map(|stage| {
                let deps: BTreeSet<usize> = stage
                    .inputs
                    .iter()
                    .filter_map(|slot| producers.get(slot.as_str()).copied())
                    .collect();
                deps.into_iter().collect()
            })
            .collect()
    }

    /// Number of distinct stages reading `slot`.
    pub fn consumer_count(&self, slot: &str) -> usize {
        self.stages
            .iter()
            .filter(|s| s.inputs.iter().any(|i| i == slot))
            .count()
    }

    /// Stage indices in dependency order (Kahn's algorithm). Among stages
    /// that are ready at the same time, declaration order wins.
    pub fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        let deps = self.dependencies();
        let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.stages.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dep in &dependents[next] {
                remaining[dep] -= 1;
                if remaining[dep] == 0 {
                    ready.insert(dep);
                }
            }
        }

        if order.len() < self.stages.len() {
            let stages = (0..self.stages.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| self.stages[i].id.clone())
                .collect();
            return Err(GraphError::Cycle { stages });
        }
        Ok(order)
    }
}
