//! Epoch loop driving warm and full training phases.
//!
//! The orchestrator owns the model and the active [`OptimizationState`] for
//! the whole run. Each epoch is strictly sequential: build batches, rebuild
//! the optimizer at the phase boundary, apply the learning rate, run the
//! training step, then persist a checkpoint before the next epoch begins.

use crate::architecture::Architecture;
use crate::artifacts::{RunId, TrainingManifest};
use crate::checkpoint::CheckpointManager;
use crate::config::RunConfig;
use crate::data::{DataPipelineAdapter, SampleSource, Topology};
use crate::device::{Device, DeviceList};
use crate::distributed::{DistributedContext, DistributedRuntime};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::RunLayout;
use crate::model::{Model, ModelAssembly, load_pretrained};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::scheduler::{OptimizationState, OptimizerScheduler, TrainingPhase};
use crate::trainer::{EpochContext, LoggingState, TrainerStep};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Init,
    WarmPhase,
    Transitioning,
    FullPhase,
    Terminated,
}

impl OrchestratorState {
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // Init resolves to a phase, or terminates when no epochs remain
            (Self::Init, Self::WarmPhase | Self::FullPhase | Self::Terminated) => true,
            (Self::WarmPhase, Self::Transitioning | Self::Terminated) => true,
            (Self::Transitioning, Self::FullPhase) => true,
            (Self::FullPhase, Self::Terminated) => true,
            (a, b) if *a == b => *a != Self::Init && *a != Self::Terminated,
            _ => false,
        }
    }

    fn for_phase(phase: TrainingPhase) -> Self {
        match phase {
            TrainingPhase::Warm => Self::WarmPhase,
            TrainingPhase::Full => Self::FullPhase,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub epochs_run: u32,
    /// Checkpoints written by this process, in epoch order.
    pub checkpoints: Vec<PathBuf>,
    /// Last epoch that completed.
    pub final_epoch: Option<u32>,
    /// Optimizer rebuilds at the phase boundary. At most one.
    pub rebuilds: u32,
    pub manifest: Option<TrainingManifest>,
}

pub struct EpochOrchestrator {
    config: Arc<RunConfig>,
    architecture: Architecture,
    context: DistributedContext,
    devices: DeviceList,
    device: Device,
    model: Model,
    scheduler: OptimizerScheduler,
    optimization: OptimizationState,
    checkpoints: CheckpointManager,
    progress: Arc<dyn ProgressSink>,
    run_id: RunId,
    state: OrchestratorState,
    start_epoch: u32,
    next_epoch: u32,
    logging: LoggingState,
}

impl std::fmt::Debug for EpochOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochOrchestrator")
            .field("run_id", &self.run_id)
            .field("architecture", &self.architecture)
            .field("context", &self.context)
            .field("state", &self.state)
            .field("next_epoch", &self.next_epoch)
            .finish_non_exhaustive()
    }
}

impl EpochOrchestrator {
    /// Resolve the architecture, join the distributed world, build the model
    /// and its optimizer, and restore from a checkpoint when configured.
    ///
    /// An unknown architecture fails before the runtime, the assembly or the
    /// filesystem is touched.
    pub async fn prepare(
        config: Arc<RunConfig>,
        assembly: &dyn ModelAssembly,
        runtime: &DistributedRuntime,
        progress: Arc<dyn ProgressSink>,
    ) -> TrainingResult<Self> {
        let architecture = config.architecture()?;
        config.validate()?;
        progress.on_event(ProgressEvent::ArchitectureResolved { architecture: architecture.tag().to_string() });

        let context = runtime.init().await?;
        progress.on_event(ProgressEvent::DistributedReady {
            rank: context.rank,
            world_size: context.world_size,
            backend: context.backend.map(|b| b.name().to_string()),
        });
        let devices = runtime.devices().clone();
        let device = runtime.primary_device(&context);

        let mut model = assembly.build(&config, architecture, &devices)?;
        if model.architecture != architecture {
            return Err(TrainingError::InvalidConfig(format!(
                "model assembly built a {} model for {architecture}",
                model.architecture
            )));
        }
        if let Some(path) = &config.model.pretrained {
            load_pretrained(&mut model, path)?;
        }

        let train = &config.train;
        let layout = RunLayout::new(config.common.output_dir.clone());
        let checkpoints = CheckpointManager::new(layout, architecture, train.keep_last);
        let scheduler = OptimizerScheduler::new(architecture, train.clone());
        let boundary = config.phase_boundary();

        let (optimization, start_epoch) = match &train.resume {
            Some(path) => {
                let header = CheckpointManager::peek(path)?;
                if header.architecture != architecture.tag() {
                    return Err(TrainingError::IncompatibleCheckpoint {
                        expected: architecture.tag().to_string(),
                        found: header.architecture,
                    });
                }
                let next = header.next_epoch();
                let phase = TrainingPhase::for_epoch(architecture, boundary, next);
                let mut optimization = scheduler.build(&mut model, phase, next)?;
                let restored = checkpoints.restore(&mut model, &mut optimization, path)?;
                progress.on_event(ProgressEvent::Resumed {
                    path: path.clone(),
                    next_epoch: restored.next_epoch,
                    optimizer_restored: restored.optimizer_restored,
                });
                (optimization, restored.next_epoch)
            }
            None => {
                let start = train.start_epoch;
                let phase = TrainingPhase::for_epoch(architecture, boundary, start);
                (scheduler.build(&mut model, phase, start)?, start)
            }
        };
        model.parameters.trainable_report().log(&format!("{} phase", optimization.phase()));

        Ok(Self {
            config,
            architecture,
            context,
            devices,
            device,
            model,
            scheduler,
            optimization,
            checkpoints,
            progress,
            run_id: RunId::new(),
            state: OrchestratorState::Init,
            start_epoch,
            next_epoch: start_epoch,
            logging: LoggingState::default(),
        })
    }

    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    #[must_use]
    pub fn context(&self) -> DistributedContext {
        self.context
    }

    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    #[must_use]
    pub fn optimization(&self) -> &OptimizationState {
        &self.optimization
    }

    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Epoch the next call to [`run`](Self::run) starts at.
    #[must_use]
    pub fn next_epoch(&self) -> u32 {
        self.next_epoch
    }

    /// Train from the current epoch up to `end_epoch` (exclusive).
    pub async fn run<S, T>(
        &mut self,
        pipeline: &mut DataPipelineAdapter<S>,
        step: &mut T,
    ) -> TrainingResult<RunSummary>
    where
        S: SampleSource,
        T: TrainerStep<S::Batch> + ?Sized,
    {
        if self.state != OrchestratorState::Init {
            return Err(TrainingError::Other(anyhow::anyhow!(
                "run already executed; orchestrator is {:?}",
                self.state
            )));
        }

        let end_epoch = self.config.train.end_epoch;
        self.emit(ProgressEvent::RunStarted {
            run_id: self.run_id.clone(),
            start_epoch: self.next_epoch,
            end_epoch,
        });

        let mut summary = RunSummary {
            run_id: self.run_id.clone(),
            epochs_run: 0,
            checkpoints: Vec::new(),
            final_epoch: None,
            rebuilds: 0,
            manifest: None,
        };

        if self.next_epoch < end_epoch {
            let phase = self.optimization.phase();
            self.enter(OrchestratorState::for_phase(phase))?;
            self.emit(ProgressEvent::PhaseEntered { phase, epoch: self.next_epoch });
        }

        let topology = Topology {
            rank: self.context.rank,
            world_size: self.context.world_size,
            local_devices: self.devices.local_count(),
        };
        let boundary = self.config.phase_boundary();
        let mut best_loss = f64::INFINITY;

        while self.next_epoch < end_epoch {
            let epoch = self.next_epoch;
            let batches = pipeline.iterator(epoch, &topology)?;
            let batch_count = batches.len();

            if self.state == OrchestratorState::WarmPhase
                && TrainingPhase::for_epoch(self.architecture, boundary, epoch) == TrainingPhase::Full
            {
                self.rebuild_for_full(epoch)?;
                summary.rebuilds += 1;
            }

            let lr = self.optimization.apply_lr(epoch);
            let phase = self.optimization.phase();
            self.emit(ProgressEvent::EpochStarted { epoch, phase, lr, batches: batch_count });

            let ctx = EpochContext {
                batches: Box::new(batches),
                batch_count,
                model: &mut self.model,
                optimizer: self.optimization.optimizer_mut(),
                device: self.device,
                devices: &self.devices,
                epoch,
                phase,
                lr,
                config: &self.config,
                logging: self.logging,
                progress: self.progress.as_ref(),
            };
            let outcome = match step.run_epoch(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(epoch, step = step.id(), error = %e, "training step failed");
                    return Err(e);
                }
            };
            self.logging = outcome.logging;
            self.emit(ProgressEvent::EpochFinished {
                epoch,
                global_step: outcome.logging.global_step,
                loss: outcome.loss,
            });

            let is_best = outcome.loss.is_some_and(|loss| loss < best_loss);
            if let Some(loss) = outcome.loss {
                best_loss = best_loss.min(loss);
            }
            if let Some(path) = self.save_checkpoint(epoch, is_best)? {
                summary.checkpoints.push(path);
            }

            summary.epochs_run += 1;
            summary.final_epoch = Some(epoch);
            self.next_epoch = epoch + 1;
        }

        self.enter(OrchestratorState::Terminated)?;

        // The manifest hashes the event log, so it must see the last event.
        self.emit(ProgressEvent::RunFinished {
            run_id: self.run_id.clone(),
            epochs_run: summary.epochs_run,
            final_epoch: summary.final_epoch,
        });

        if self.context.is_primary() {
            if let Some(last) = summary.checkpoints.last() {
                let manifest =
                    self.checkpoints.write_manifest(self.run_id.clone(), self.start_epoch, end_epoch, last.clone())?;
                summary.manifest = Some(manifest);
            }
        }
        Ok(summary)
    }

    /// Replace the warm optimizer with a freshly built full-phase one. The
    /// warm state is dropped here and never referenced again.
    fn rebuild_for_full(&mut self, epoch: u32) -> TrainingResult<()> {
        self.enter(OrchestratorState::Transitioning)?;
        let from = self.optimization.phase();
        self.optimization = self.scheduler.build(&mut self.model, TrainingPhase::Full, epoch)?;
        self.model.parameters.trainable_report().log("full phase");
        self.enter(OrchestratorState::FullPhase)?;
        self.emit(ProgressEvent::PhaseTransition { from, to: TrainingPhase::Full, epoch });
        Ok(())
    }

    fn save_checkpoint(&mut self, epoch: u32, is_best: bool) -> TrainingResult<Option<PathBuf>> {
        if !self.context.is_primary() {
            debug!(epoch, rank = self.context.rank, "not the primary rank; skipping checkpoint");
            return Ok(None);
        }
        let path = self.checkpoints.save(
            &self.model,
            epoch,
            self.optimization.optimizer(),
            self.optimization.phase(),
            is_best,
        )?;
        self.emit(ProgressEvent::CheckpointSaved { epoch, path: path.clone() });
        for pruned in self.checkpoints.prune()? {
            self.emit(ProgressEvent::CheckpointPruned { path: pruned });
        }
        Ok(Some(path))
    }

    fn enter(&mut self, to: OrchestratorState) -> TrainingResult<()> {
        if !self.state.can_transition_to(to) {
            error!(from = ?self.state, to = ?to, "invalid orchestrator transition");
            return Err(TrainingError::Other(anyhow::anyhow!(
                "invalid orchestrator transition {:?} -> {:?}",
                self.state,
                to
            )));
        }
        if self.state != to {
            info!(from = ?self.state, to = ?to, "orchestrator state");
        }
        self.state = to;
        Ok(())
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.on_event(event);
    }
}
