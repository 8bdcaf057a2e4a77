//! Per-epoch learning rate tables.

use crate::config::{ScheduleConfig, ScheduleKind, TrainConfig};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

const DEFAULT_MULT: f64 = 0.1;

/// Expand a schedule description into `epochs` learning rates.
pub fn expand(schedule: &ScheduleConfig, epochs: u32) -> TrainingResult<Vec<f64>> {
    if epochs == 0 {
        return Err(TrainingError::Optimizer("a schedule must cover at least one epoch".to_string()));
    }
    let n = epochs as usize;
    let start = schedule.start_lr;
    let end = || {
        schedule
            .end_lr
            .ok_or_else(|| TrainingError::Optimizer(format!("{:?} schedule requires end_lr", schedule.kind)))
    };

    let table = match schedule.kind {
        ScheduleKind::Log => logspace(start, end()?, n),
        ScheduleKind::Linear => linspace(start, end()?, n),
        ScheduleKind::Cos => {
            let end = end()?;
            (0..n)
                .map(|i| end + (start - end) * (1.0 + (std::f64::consts::PI * i as f64 / n as f64).cos()) * 0.5)
                .collect()
        }
        ScheduleKind::Step => {
            let step = schedule.step.filter(|s| *s > 0).ok_or_else(|| {
                TrainingError::Optimizer("step schedule requires step >= 1".to_string())
            })?;
            // Without an explicit mult, end_lr is reached after epochs / step decays.
            let mult = match (schedule.mult, schedule.end_lr) {
                (Some(mult), _) => mult,
                (None, Some(end)) => {
                    let decays = (epochs / step).max(1);
                    (end / start).powf(1.0 / f64::from(decays))
                }
                (None, None) => DEFAULT_MULT,
            };
            (0..epochs).map(|i| start * mult.powi((i / step) as i32)).collect()
        }
        ScheduleKind::MultiStep => {
            let mult = schedule.mult.unwrap_or(DEFAULT_MULT);
            let mut milestones = schedule.milestones.clone();
            milestones.sort_unstable();
            (0..epochs)
                .map(|i| {
                    let passed = milestones.partition_point(|m| *m <= i);
                    start * mult.powi(passed as i32)
                })
                .collect()
        }
    };
    Ok(table)
}

/// `n` points evenly spaced in log10 between `start` and `end`, inclusive.
#[must_use]
pub fn logspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    let (a, b) = (start.log10(), end.log10());
    linspace(a, b, n).into_iter().map(|e| 10f64.powf(e)).collect()
}

#[must_use]
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let span = (end - start) / (n - 1) as f64;
            (0..n).map(|i| span.mul_add(i as f64, start)).collect()
        }
    }
}

/// Stateful per-epoch schedule: an optional warmup table followed by the main
/// table. Group learning rates are scaled relative to `start_lr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSchedule {
    lr_spaces: Vec<f64>,
    start_lr: f64,
    last_epoch: Option<u32>,
}

impl EpochSchedule {
    /// Build the schedule covering epochs `0..train.end_epoch`.
    pub fn from_config(train: &TrainConfig) -> TrainingResult<Self> {
        let (mut lr_spaces, main_epochs) = match &train.warmup {
            Some(warmup) => {
                if warmup.epoch >= train.end_epoch {
                    return Err(TrainingError::Optimizer(format!(
                        "warmup of {} epochs leaves nothing of a {} epoch run",
                        warmup.epoch, train.end_epoch
                    )));
                }
                (expand(&warmup.schedule, warmup.epoch)?, train.end_epoch - warmup.epoch)
            }
            None => (Vec::new(), train.end_epoch),
        };
        let main = expand(&train.lr, main_epochs)?;
        let start_lr = main[0];
        lr_spaces.extend(main);
        Ok(Self { lr_spaces, start_lr, last_epoch: None })
    }

    #[must_use]
    pub fn start_lr(&self) -> f64 {
        self.start_lr
    }

    #[must_use]
    pub fn last_epoch(&self) -> Option<u32> {
        self.last_epoch
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lr_spaces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lr_spaces.is_empty()
    }

    /// Base learning rate at `epoch`. Epochs past the table use its last entry.
    #[must_use]
    pub fn lr_at(&self, epoch: u32) -> f64 {
        lookup(&self.lr_spaces, epoch)
    }

    /// Learning rate for a group created with `initial_lr`.
    #[must_use]
    pub fn group_lr(&self, epoch: u32, initial_lr: f64) -> f64 {
        self.lr_at(epoch) * initial_lr / self.start_lr
    }

    /// Move the schedule to `epoch`.
    pub fn step_to(&mut self, epoch: u32) {
        self.last_epoch = Some(epoch);
    }
}

pub(crate) fn lookup(table: &[f64], epoch: u32) -> f64 {
    let idx = (epoch as usize).min(table.len().saturating_sub(1));
    table.get(idx).copied().unwrap_or_default()
}
