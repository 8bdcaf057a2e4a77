//! Trackforge Training
//!
//! Epoch orchestration for Siamese tracker training:
//! - Resolving the architecture and its learning-rate strategy
//! - Joining a distributed world over TCP rendezvous (`DistributedRuntime`)
//! - Building optimizers per training phase (`OptimizerScheduler`)
//! - Writing and restoring per-epoch checkpoints (`CheckpointManager`)
//! - Driving the warm and full phases epoch by epoch (`EpochOrchestrator`)

pub mod architecture;
pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod distributed;
pub mod error;
pub mod layout;
pub mod model;
pub mod optimizer;
pub mod orchestrator;
pub mod progress;
pub mod schedule;
pub mod scheduler;
pub mod synthetic;
pub mod trainer;

pub use architecture::{Architecture, LrStrategy};
pub use artifacts::{ArtifactKind, RunId, TrainingArtifact, TrainingManifest};
pub use checkpoint::{Checkpoint, CheckpointEntry, CheckpointHeader, CheckpointManager, RestoredState};
pub use config::{RunConfig, ScheduleConfig, ScheduleKind, TrainConfig};
pub use data::{DataPipelineAdapter, EpochBatches, LoaderOptions, SampleSource, SamplingStrategy, Topology};
pub use device::{Device, DeviceList};
pub use distributed::{Backend, DistributedContext, DistributedRuntime};
pub use error::{ErrorKind, TrainingError, TrainingResult};
pub use layout::RunLayout;
pub use model::{Gradients, Model, ModelAssembly, Parameter, ParameterSet, load_pretrained};
pub use optimizer::{OptimizerState, ParamGroup, Sgd};
pub use orchestrator::{EpochOrchestrator, OrchestratorState, RunSummary};
pub use progress::{JsonlProgressSink, ProgressEvent, ProgressFanout, ProgressSink, TracingProgressSink};
pub use scheduler::{LrPlan, OptimizationState, OptimizerScheduler, TrainingPhase};
pub use synthetic::{PairBatch, RegressionStep, SyntheticAssembly, SyntheticPairs};
pub use trainer::{BatchStream, EpochContext, EpochOutcome, LoggingState, TrainerStep};
