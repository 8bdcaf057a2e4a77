use crate::config::RunConfig;
use crate::device::{Device, DeviceList};
use crate::error::TrainingResult;
use crate::model::Model;
use crate::optimizer::Sgd;
use crate::progress::ProgressSink;
use crate::scheduler::TrainingPhase;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Writer state threaded through every epoch of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingState {
    pub global_step: u64,
}

/// Batches handed to a training step. Yields errors raised while collating.
pub type BatchStream<'a, B> = Box<dyn Iterator<Item = TrainingResult<B>> + Send + 'a>;

/// Everything one epoch of training may touch.
pub struct EpochContext<'a, B> {
    pub batches: BatchStream<'a, B>,
    /// Number of batches `batches` will yield.
    pub batch_count: usize,
    pub model: &'a mut Model,
    pub optimizer: &'a mut Sgd,
    pub device: Device,
    pub devices: &'a DeviceList,
    pub epoch: u32,
    pub phase: TrainingPhase,
    pub lr: f64,
    pub config: &'a RunConfig,
    pub logging: LoggingState,
    pub progress: &'a dyn ProgressSink,
}

impl<B> std::fmt::Debug for EpochContext<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochContext")
            .field("batch_count", &self.batch_count)
            .field("device", &self.device)
            .field("epoch", &self.epoch)
            .field("phase", &self.phase)
            .field("lr", &self.lr)
            .field("logging", &self.logging)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochOutcome {
    pub logging: LoggingState,
    /// Mean loss over the epoch, when the step reports one.
    pub loss: Option<f64>,
}

/// One epoch of forward, backward and optimizer updates. Implemented
/// outside the orchestrator.
#[async_trait]
pub trait TrainerStep<B: Send>: Send {
    fn id(&self) -> &'static str;

    async fn run_epoch(&mut self, ctx: EpochContext<'_, B>) -> TrainingResult<EpochOutcome>;
}
