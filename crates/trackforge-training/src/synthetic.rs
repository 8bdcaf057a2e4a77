//! In-process collaborators that let a run execute end to end without an
//! external model stack: a deterministic parameter layout per architecture,
//! a generated sample source and a regression training step.

use crate::architecture::{Architecture, LrStrategy};
use crate::config::RunConfig;
use crate::data::SampleSource;
use crate::device::DeviceList;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{Gradients, Model, ModelAssembly, Parameter, ParameterSet};
use crate::trainer::{EpochContext, EpochOutcome, TrainerStep};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Builds a small fixed parameter layout for each architecture.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticAssembly {
    width: usize,
}

impl SyntheticAssembly {
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }

    fn layout(architecture: Architecture) -> Vec<&'static str> {
        match architecture.lr_strategy() {
            LrStrategy::Table => vec![
                "backbone.layer1.weight",
                "backbone.layer2.weight",
                "backbone.layer3.weight",
                "head.xcorr.weight",
            ],
            LrStrategy::Scheduler => vec![
                "backbone.layer1.weight",
                "backbone.layer2.weight",
                "backbone.layer3.weight",
                "backbone.layer4.weight",
                "neck.weight",
                "head.cls.weight",
                "head.reg.weight",
            ],
        }
    }
}

impl Default for SyntheticAssembly {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ModelAssembly for SyntheticAssembly {
    fn build(&self, config: &RunConfig, architecture: Architecture, devices: &DeviceList) -> TrainingResult<Model> {
        let mut rng = StdRng::seed_from_u64(config.common.seed);
        let mut parameters = ParameterSet::new();
        for name in Self::layout(architecture) {
            let values = (0..self.width).map(|_| rng.gen_range(-0.1f32..0.1)).collect();
            parameters.insert(name, Parameter::new(values));
        }
        debug!(%architecture, params = parameters.len(), width = self.width, "assembled synthetic model");
        Ok(Model::new(architecture, devices.clone(), parameters))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairBatch {
    pub epoch: u32,
    pub indices: Vec<usize>,
    pub targets: Vec<f32>,
}

/// Deterministic template/search pairs reduced to one scalar target each.
#[derive(Debug, Clone)]
pub struct SyntheticPairs {
    samples_per_epoch: usize,
    seed: u64,
    epoch: Option<u32>,
    targets: Vec<f32>,
}

impl SyntheticPairs {
    #[must_use]
    pub fn new(samples_per_epoch: usize, seed: u64) -> Self {
        Self { samples_per_epoch, seed, epoch: None, targets: Vec::new() }
    }
}

impl SampleSource for SyntheticPairs {
    type Batch = PairBatch;

    fn prepare_epoch(&mut self, epoch: u32) -> TrainingResult<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed ^ u64::from(epoch));
        self.targets = (0..self.samples_per_epoch).map(|_| rng.gen_range(0.5f32..1.5)).collect();
        self.epoch = Some(epoch);
        Ok(self.samples_per_epoch)
    }

    fn collate(&self, indices: &[usize]) -> TrainingResult<PairBatch> {
        let epoch = self
            .epoch
            .ok_or_else(|| TrainingError::Data("collate called before prepare_epoch".to_string()))?;
        let targets = indices
            .iter()
            .map(|&i| {
                self.targets
                    .get(i)
                    .copied()
                    .ok_or_else(|| TrainingError::Data(format!("sample {i} out of range")))
            })
            .collect::<TrainingResult<Vec<_>>>()?;
        Ok(PairBatch { epoch, indices: indices.to_vec(), targets })
    }
}

/// Pulls every trainable parameter toward the batch's mean target.
#[derive(Debug, Default)]
pub struct RegressionStep;

impl RegressionStep {
    fn loss_and_grads(model: &Model, target: f32) -> (f64, Gradients) {
        let mut loss = 0.0f64;
        let mut count = 0usize;
        let mut grads = Gradients::new();
        for (name, param) in model.parameters.iter().filter(|(_, p)| p.trainable) {
            let n = param.values.len().max(1) as f32;
            let grad = param
                .values
                .iter()
                .map(|w| {
                    let diff = w - target;
                    loss += f64::from(diff * diff);
                    2.0 * diff / n
                })
                .collect();
            count += param.values.len();
            grads.insert(name.clone(), grad);
        }
        (loss / count.max(1) as f64, grads)
    }
}

#[async_trait]
impl TrainerStep<PairBatch> for RegressionStep {
    fn id(&self) -> &'static str {
        "regression"
    }

    async fn run_epoch(&mut self, ctx: EpochContext<'_, PairBatch>) -> TrainingResult<EpochOutcome> {
        let EpochContext { batches, model, optimizer, mut logging, .. } = ctx;
        let mut total = 0.0;
        let mut seen = 0u32;
        for batch in batches {
            let batch = batch?;
            if batch.targets.is_empty() {
                continue;
            }
            let target = batch.targets.iter().sum::<f32>() / batch.targets.len() as f32;
            let (loss, grads) = Self::loss_and_grads(model, target);
            optimizer.step(&mut model.parameters, &grads)?;
            total += loss;
            seen += 1;
            logging.global_step += 1;
        }
        let loss = (seen > 0).then(|| total / f64::from(seen));
        Ok(EpochOutcome { logging, loss })
    }
}
