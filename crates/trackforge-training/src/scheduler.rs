//! Optimizer and learning-rate construction per training phase.
//!
//! Crossing from the warm phase into the full phase rebuilds the optimizer
//! from scratch: momentum buffers and schedule position from the warm phase
//! are dropped, and only the model parameters carry over. Callers replace
//! their [`OptimizationState`] by value so the warm-phase state cannot be
//! reached after the rebuild.

use crate::architecture::{Architecture, LrStrategy};
use crate::config::TrainConfig;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{BACKBONE_PREFIX, Model};
use crate::optimizer::{ParamGroup, Sgd};
use crate::schedule::{self, EpochSchedule};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    /// Backbone frozen, head trainable.
    Warm,
    /// Every configured parameter trainable.
    Full,
}

impl TrainingPhase {
    /// Phase in effect at `epoch`.
    #[must_use]
    pub fn for_epoch(architecture: Architecture, boundary: Option<u32>, epoch: u32) -> Self {
        match boundary {
            Some(boundary) if architecture.has_warm_phase() && epoch < boundary => Self::Warm,
            _ => Self::Full,
        }
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warm => f.write_str("warm"),
            Self::Full => f.write_str("full"),
        }
    }
}

/// Where the learning rate for an epoch comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum LrPlan {
    Table(Vec<f64>),
    Schedule(EpochSchedule),
}

#[derive(Debug)]
pub struct OptimizationState {
    optimizer: Sgd,
    plan: LrPlan,
    phase: TrainingPhase,
}

impl OptimizationState {
    #[must_use]
    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Sgd {
        &mut self.optimizer
    }

    #[must_use]
    pub fn plan(&self) -> &LrPlan {
        &self.plan
    }

    #[must_use]
    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Base learning rate for `epoch`. Has no side effects.
    #[must_use]
    pub fn resolve_lr(&self, epoch: u32) -> f64 {
        match &self.plan {
            LrPlan::Table(table) => schedule::lookup(table, epoch),
            LrPlan::Schedule(schedule) => schedule.lr_at(epoch),
        }
    }

    /// Resolve the learning rate for `epoch` and write it into every param group.
    ///
    /// Table plans write the same value everywhere; schedules scale each
    /// group by its initial learning rate.
    pub fn apply_lr(&mut self, epoch: u32) -> f64 {
        let lr = self.resolve_lr(epoch);
        let Self { optimizer, plan, .. } = self;
        match plan {
            LrPlan::Table(_) => optimizer.set_lr(lr),
            LrPlan::Schedule(schedule) => {
                schedule.step_to(epoch);
                let schedule = &*schedule;
                optimizer.set_lr_with(|group| schedule.group_lr(epoch, group.initial_lr));
            }
        }
        lr
    }
}

/// Builds optimization state for one architecture and training config.
#[derive(Debug, Clone)]
pub struct OptimizerScheduler {
    architecture: Architecture,
    train: TrainConfig,
}

impl OptimizerScheduler {
    #[must_use]
    pub fn new(architecture: Architecture, train: TrainConfig) -> Self {
        Self { architecture, train }
    }

    /// Set trainable flags on `model` for `phase` and build a fresh optimizer
    /// positioned at `start_epoch`.
    pub fn build(&self, model: &mut Model, phase: TrainingPhase, start_epoch: u32) -> TrainingResult<OptimizationState> {
        let mut state = match self.architecture.lr_strategy() {
            LrStrategy::Table => self.build_table(model, phase)?,
            LrStrategy::Scheduler => self.build_scheduled(model, phase)?,
        };
        let lr = state.apply_lr(start_epoch);
        debug!(
            architecture = %self.architecture,
            %phase,
            start_epoch,
            lr,
            groups = state.optimizer.param_groups().len(),
            "built optimizer"
        );
        Ok(state)
    }

    fn build_table(&self, model: &mut Model, phase: TrainingPhase) -> TrainingResult<OptimizationState> {
        model.parameters.unfreeze_prefix("");
        let table = schedule::expand(&self.train.lr, self.train.end_epoch)?;
        let params = model.parameters.trainable_names();
        let optimizer = Sgd::new(vec![self.group("all", params, self.train.lr.start_lr)])?;
        Ok(OptimizationState { optimizer, plan: LrPlan::Table(table), phase })
    }

    fn build_scheduled(&self, model: &mut Model, phase: TrainingPhase) -> TrainingResult<OptimizationState> {
        let params = &mut model.parameters;
        params.unfreeze_prefix("");
        params.freeze_prefix(BACKBONE_PREFIX);
        if phase == TrainingPhase::Full {
            let layers = &self.train.backbone.train_layers;
            if layers.is_empty() {
                params.unfreeze_prefix(BACKBONE_PREFIX);
            } else {
                for layer in layers {
                    let prefix = format!("{BACKBONE_PREFIX}{layer}.");
                    if params.unfreeze_prefix(&prefix) == 0 {
                        return Err(TrainingError::InvalidConfig(format!(
                            "backbone layer {layer:?} has no parameters in the {} model",
                            self.architecture
                        )));
                    }
                }
            }
        }

        let schedule = EpochSchedule::from_config(&self.train)?;
        let start_lr = schedule.start_lr();
        let (backbone, head): (Vec<String>, Vec<String>) =
            params.trainable_names().into_iter().partition(|name| name.starts_with(BACKBONE_PREFIX));

        let mut groups = Vec::with_capacity(2);
        if !backbone.is_empty() {
            groups.push(self.group("backbone", backbone, start_lr * self.train.backbone.layers_lr));
        }
        if !head.is_empty() {
            groups.push(self.group("head", head, start_lr));
        }
        let optimizer = Sgd::new(groups)?;
        Ok(OptimizationState { optimizer, plan: LrPlan::Schedule(schedule), phase })
    }

    fn group(&self, name: &str, params: Vec<String>, lr: f64) -> ParamGroup {
        ParamGroup {
            name: name.to_string(),
            params,
            lr,
            initial_lr: lr,
            momentum: self.train.momentum,
            weight_decay: self.train.weight_decay,
        }
    }
}
