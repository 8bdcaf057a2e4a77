use crate::artifacts::RunId;
use crate::error::TrainingResult;
use crate::scheduler::TrainingPhase;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted { run_id: RunId, start_epoch: u32, end_epoch: u32 },
    ArchitectureResolved { architecture: String },
    DistributedReady { rank: u32, world_size: u32, backend: Option<String> },
    Resumed { path: PathBuf, next_epoch: u32, optimizer_restored: bool },
    PhaseEntered { phase: TrainingPhase, epoch: u32 },
    PhaseTransition { from: TrainingPhase, to: TrainingPhase, epoch: u32 },
    EpochStarted { epoch: u32, phase: TrainingPhase, lr: f64, batches: usize },
    EpochFinished { epoch: u32, global_step: u64, loss: Option<f64> },
    CheckpointSaved { epoch: u32, path: PathBuf },
    CheckpointPruned { path: PathBuf },
    RunFinished { run_id: RunId, epochs_run: u32, final_epoch: Option<u32> },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Renders events as tracing records.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { run_id, start_epoch, end_epoch } => {
                info!(%run_id, start_epoch, end_epoch, "run started");
            }
            ProgressEvent::ArchitectureResolved { architecture } => info!(%architecture, "architecture resolved"),
            ProgressEvent::DistributedReady { rank, world_size, backend } => {
                info!(rank, world_size, backend = backend.as_deref().unwrap_or("none"), "distributed ready");
            }
            ProgressEvent::Resumed { path, next_epoch, optimizer_restored } => {
                info!(path = %path.display(), next_epoch, optimizer_restored, "resumed");
            }
            ProgressEvent::PhaseEntered { phase, epoch } => info!(%phase, epoch, "entering phase"),
            ProgressEvent::PhaseTransition { from, to, epoch } => {
                info!(%from, %to, epoch, "phase transition, optimizer rebuilt");
            }
            ProgressEvent::EpochStarted { epoch, phase, lr, batches } => {
                info!(epoch, %phase, lr, batches, "epoch started");
            }
            ProgressEvent::EpochFinished { epoch, global_step, loss } => match loss {
                Some(loss) => info!(epoch, global_step, loss, "epoch finished"),
                None => info!(epoch, global_step, "epoch finished"),
            },
            ProgressEvent::CheckpointSaved { epoch, path } => {
                info!(epoch, path = %path.display(), "checkpoint saved");
            }
            ProgressEvent::CheckpointPruned { path } => info!(path = %path.display(), "checkpoint pruned"),
            ProgressEvent::RunFinished { run_id, epochs_run, final_epoch } => {
                info!(%run_id, epochs_run, ?final_epoch, "run finished");
            }
        }
    }
}

/// Appends one JSON object per event to a file.
#[derive(Debug)]
pub struct JsonlProgressSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlProgressSink {
    pub fn create(path: &Path) -> TrainingResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &ProgressEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

impl ProgressSink for JsonlProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        // Tracking is best effort; a failed write must not stop training.
        if let Err(e) = self.append(&event) {
            warn!(path = %self.path.display(), error = %e, "failed to append progress event");
        }
    }
}

/// Delivers every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct ProgressFanout {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl ProgressFanout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for ProgressFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressFanout").field("sinks", &self.sinks.len()).finish()
    }
}

impl ProgressSink for ProgressFanout {
    fn on_event(&self, event: ProgressEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.on_event(event.clone());
            }
            last.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for Collect {
        fn on_event(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_jsonl_sink_appends_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("events.jsonl");
        let sink = JsonlProgressSink::create(&path).unwrap();
        sink.on_event(ProgressEvent::PhaseEntered { phase: TrainingPhase::Warm, epoch: 0 });
        sink.on_event(ProgressEvent::CheckpointSaved { epoch: 0, path: PathBuf::from("c.json") });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> =
            content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "phase_entered");
        assert_eq!(lines[0]["phase"], "warm");
        assert_eq!(lines[1]["type"], "checkpoint_saved");
    }

    #[test]
    fn test_fanout_delivers_to_every_sink() {
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let fanout = ProgressFanout::new().with(a.clone()).with(b.clone());
        fanout.on_event(ProgressEvent::ArchitectureResolved { architecture: "Ocean".to_string() });

        assert_eq!(fanout.len(), 2);
        assert_eq!(a.0.lock().unwrap().len(), 1);
        assert_eq!(*b.0.lock().unwrap(), *a.0.lock().unwrap());
    }
}
