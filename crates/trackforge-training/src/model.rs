//! Parameter carrier shared by the orchestrator, optimizer and training step.
//!
//! Model assembly itself is delegated to a [`ModelAssembly`]; this module
//! only fixes how named parameters are stored, frozen and snapshotted.

use crate::architecture::Architecture;
use crate::config::RunConfig;
use crate::device::DeviceList;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// Name prefix of every backbone parameter.
pub const BACKBONE_PREFIX: &str = "backbone.";

/// Prefix added by data-parallel wrappers when a model is saved.
const WRAPPER_PREFIX: &str = "module.";

/// Gradients keyed by parameter name.
pub type Gradients = BTreeMap<String, Vec<f32>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub values: Vec<f32>,
    #[serde(default = "default_trainable")]
    pub trainable: bool,
}

fn default_trainable() -> bool {
    true
}

impl Parameter {
    #[must_use]
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, trainable: true }
    }
}

/// Ordered, named parameters of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    params: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, param: Parameter) {
        self.params.insert(name.into(), param);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Parameter)> {
        self.params.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Marks every parameter whose name starts with `prefix` as trainable or frozen.
    /// Returns how many parameters matched.
    pub fn set_trainable_prefix(&mut self, prefix: &str, trainable: bool) -> usize {
        let mut touched = 0;
        for (name, param) in &mut self.params {
            if name.starts_with(prefix) {
                param.trainable = trainable;
                touched += 1;
            }
        }
        touched
    }

    pub fn freeze_prefix(&mut self, prefix: &str) -> usize {
        self.set_trainable_prefix(prefix, false)
    }

    pub fn unfreeze_prefix(&mut self, prefix: &str) -> usize {
        self.set_trainable_prefix(prefix, true)
    }

    #[must_use]
    pub fn trainable_names(&self) -> Vec<String> {
        self.params.iter().filter(|(_, p)| p.trainable).map(|(n, _)| n.clone()).collect()
    }

    #[must_use]
    pub fn trainable_report(&self) -> TrainableReport {
        let mut report = TrainableReport::default();
        for (name, param) in &self.params {
            let count = param.values.len();
            report.total_values += count;
            if param.trainable {
                report.trainable_values += count;
                report.trainable.push(name.clone());
            } else {
                report.frozen += 1;
            }
        }
        report
    }
}

/// Summary of which parameters the optimizer will see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainableReport {
    pub trainable: Vec<String>,
    pub frozen: usize,
    pub trainable_values: usize,
    pub total_values: usize,
}

impl TrainableReport {
    pub fn log(&self, label: &str) {
        info!(
            label,
            trainable = self.trainable.len(),
            frozen = self.frozen,
            trainable_values = self.trainable_values,
            total_values = self.total_values,
            "trainable parameters"
        );
        for name in &self.trainable {
            debug!(label, name = name.as_str(), "trainable");
        }
    }
}

/// A model as seen by the orchestrator: its architecture, the devices it was
/// placed on and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub architecture: Architecture,
    pub devices: DeviceList,
    pub parameters: ParameterSet,
}

impl Model {
    #[must_use]
    pub fn new(architecture: Architecture, devices: DeviceList, parameters: ParameterSet) -> Self {
        Self { architecture, devices, parameters }
    }
}

/// Builds the model for an architecture. Implemented outside the orchestrator.
pub trait ModelAssembly: Send + Sync {
    fn build(&self, config: &RunConfig, architecture: Architecture, devices: &DeviceList) -> TrainingResult<Model>;
}

/// Load a JSON parameter snapshot into `model`.
///
/// Keys saved from a data-parallel wrapper carry a `module.` prefix that is
/// stripped first. Parameters whose shape differs are skipped. At least one
/// key must match.
pub fn load_pretrained(model: &mut Model, path: &Path) -> TrainingResult<usize> {
    if !path.exists() {
        return Err(TrainingError::CheckpointNotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    let snapshot: BTreeMap<String, Vec<f32>> = serde_json::from_slice(&bytes)?;

    let mut loaded = BTreeSet::new();
    let mut unused = 0usize;
    for (raw_name, values) in snapshot {
        let name = raw_name.strip_prefix(WRAPPER_PREFIX).unwrap_or(&raw_name);
        if loaded.contains(name) {
            warn!(key = %raw_name, "pretrained key duplicates an already loaded parameter; ignoring");
            unused += 1;
            continue;
        }
        match model.parameters.get_mut(name) {
            Some(param) if param.values.len() == values.len() => {
                param.values = values;
                loaded.insert(name.to_string());
            }
            Some(param) => {
                warn!(
                    name,
                    expected = param.values.len(),
                    found = values.len(),
                    "pretrained shape mismatch; keeping initial values"
                );
                unused += 1;
            }
            None => unused += 1,
        }
    }

    if loaded.is_empty() {
        return Err(TrainingError::Checkpoint(format!(
            "no pretrained parameter in {} matches the {} model",
            path.display(),
            model.architecture
        )));
    }

    let missing = model.parameters.len().saturating_sub(loaded.len());
    info!(path = %path.display(), loaded = loaded.len(), missing, unused, "loaded pretrained weights");
    Ok(loaded.len())
}
