//! SGD with momentum and weight decay over named parameter groups.

use crate::error::{TrainingError, TrainingResult};
use crate::model::{Gradients, ParameterSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<String>,
    /// Learning rate used by the next `step`.
    pub lr: f64,
    /// Learning rate the group was created with; schedules scale relative to it.
    pub initial_lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

/// Serializable optimizer state: group hyper-parameters plus momentum buffers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub groups: Vec<ParamGroup>,
    pub momentum_buffers: BTreeMap<String, Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    groups: Vec<ParamGroup>,
    momentum_buffers: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(groups: Vec<ParamGroup>) -> TrainingResult<Self> {
        if groups.is_empty() {
            return Err(TrainingError::Optimizer("optimizer needs at least one param group".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for group in &groups {
            if group.params.is_empty() {
                return Err(TrainingError::Optimizer(format!("param group {:?} is empty", group.name)));
            }
            for name in &group.params {
                if !seen.insert(name.as_str()) {
                    return Err(TrainingError::Optimizer(format!("parameter {name} appears in two groups")));
                }
            }
        }
        Ok(Self { groups, momentum_buffers: BTreeMap::new() })
    }

    #[must_use]
    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Write the same learning rate into every group.
    pub fn set_lr(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }

    /// Write `lr_for(group)` into each group.
    pub fn set_lr_with(&mut self, mut lr_for: impl FnMut(&ParamGroup) -> f64) {
        for group in &mut self.groups {
            group.lr = lr_for(group);
        }
    }

    /// One update of every parameter that has a gradient.
    ///
    /// Frozen parameters are skipped even when a gradient is supplied.
    pub fn step(&mut self, params: &mut ParameterSet, grads: &Gradients) -> TrainingResult<()> {
        for group in &self.groups {
            let lr = group.lr as f32;
            let momentum = group.momentum as f32;
            let decay = group.weight_decay as f32;
            for name in &group.params {
                let Some(grad) = grads.get(name) else { continue };
                let param = params
                    .get_mut(name)
                    .ok_or_else(|| TrainingError::Optimizer(format!("unknown parameter {name}")))?;
                if !param.trainable {
                    continue;
                }
                if grad.len() != param.values.len() {
                    return Err(TrainingError::Optimizer(format!(
                        "gradient for {name} has {} values, parameter has {}",
                        grad.len(),
                        param.values.len()
                    )));
                }

                let buf = self
                    .momentum_buffers
                    .entry(name.clone())
                    .or_insert_with(|| vec![0.0; grad.len()]);
                for ((w, g), v) in param.values.iter_mut().zip(grad).zip(buf.iter_mut()) {
                    let d = g + decay * *w;
                    *v = momentum * *v + d;
                    *w -= lr * *v;
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn state_dict(&self) -> OptimizerState {
        OptimizerState { groups: self.groups.clone(), momentum_buffers: self.momentum_buffers.clone() }
    }

    /// Replace group hyper-parameters and buffers from a snapshot taken of an
    /// optimizer with the same group layout.
    pub fn load_state_dict(&mut self, state: OptimizerState) -> TrainingResult<()> {
        if state.groups.len() != self.groups.len() {
            return Err(TrainingError::Optimizer(format!(
                "snapshot has {} param groups, optimizer has {}",
                state.groups.len(),
                self.groups.len()
            )));
        }
        for (mine, theirs) in self.groups.iter().zip(&state.groups) {
            if mine.name != theirs.name || mine.params != theirs.params {
                return Err(TrainingError::Optimizer(format!(
                    "param group {:?} does not match snapshot group {:?}",
                    mine.name, theirs.name
                )));
            }
        }
        self.groups = state.groups;
        self.momentum_buffers = state.momentum_buffers;
        Ok(())
    }
}
