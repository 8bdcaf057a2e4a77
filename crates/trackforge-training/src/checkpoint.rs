//! Per-epoch checkpoints.
//!
//! Every completed epoch is written, whether or not it improved anything.
//! A checkpoint stores the completed epoch; restoring it resumes at the
//! following epoch.

use crate::architecture::Architecture;
use crate::artifacts::{ArtifactKind, RunId, TrainingManifest, make_artifact};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{RunLayout, checkpoint_epoch};
use crate::model::{Model, ParameterSet};
use crate::optimizer::{OptimizerState, Sgd};
use crate::scheduler::{OptimizationState, TrainingPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    /// Last completed epoch.
    pub epoch: u32,
    pub architecture: String,
    pub phase: TrainingPhase,
    /// Advisory only; does not decide whether the checkpoint is written.
    #[serde(default)]
    pub is_best: bool,
    pub saved_at: DateTime<Utc>,
    pub parameters: ParameterSet,
    pub optimizer: OptimizerState,
}

/// Checkpoint metadata without the tensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub format_version: u32,
    pub epoch: u32,
    pub architecture: String,
    pub phase: TrainingPhase,
    #[serde(default)]
    pub is_best: bool,
}

impl CheckpointHeader {
    #[must_use]
    pub fn next_epoch(&self) -> u32 {
        self.epoch + 1
    }
}

/// A checkpoint file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub epoch: u32,
    pub path: PathBuf,
}

/// Result of restoring a checkpoint into a live model and optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredState {
    pub next_epoch: u32,
    pub architecture: Architecture,
    /// False when the checkpoint was taken in the other phase and its
    /// optimizer snapshot was discarded.
    pub optimizer_restored: bool,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    layout: RunLayout,
    architecture: Architecture,
    keep_last: Option<usize>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(layout: RunLayout, architecture: Architecture, keep_last: Option<usize>) -> Self {
        Self { layout, architecture, keep_last }
    }

    #[must_use]
    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    #[must_use]
    pub fn path_for(&self, epoch: u32) -> PathBuf {
        self.layout.checkpoint_path(self.architecture, epoch)
    }

    /// Persist the state after completing `epoch`.
    pub fn save(
        &self,
        model: &Model,
        epoch: u32,
        optimizer: &Sgd,
        phase: TrainingPhase,
        is_best: bool,
    ) -> TrainingResult<PathBuf> {
        if model.architecture != self.architecture {
            return Err(TrainingError::IncompatibleCheckpoint {
                expected: self.architecture.tag().to_string(),
                found: model.architecture.tag().to_string(),
            });
        }
        self.layout.ensure_run_dirs(self.architecture)?;

        let checkpoint = Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            epoch,
            architecture: self.architecture.tag().to_string(),
            phase,
            is_best,
            saved_at: Utc::now(),
            parameters: model.parameters.clone(),
            optimizer: optimizer.state_dict(),
        };
        let path = self.path_for(epoch);
        write_atomic(&path, &serde_json::to_vec(&checkpoint)?)?;
        debug!(epoch, path = %path.display(), "checkpoint written");
        Ok(path)
    }

    /// Read the metadata of a checkpoint without touching any live state.
    pub fn peek(path: &Path) -> TrainingResult<CheckpointHeader> {
        let bytes = read_checkpoint_bytes(path)?;
        let header: CheckpointHeader = serde_json::from_slice(&bytes)?;
        check_format(header.format_version)?;
        Ok(header)
    }

    /// Load `path` into `model` and `state` in place.
    ///
    /// The architecture tag must match exactly and every parameter must be
    /// present with the same shape; nothing is modified otherwise. When the
    /// checkpoint phase differs from `state`'s phase the optimizer snapshot
    /// is dropped, matching the rebuild at the phase boundary.
    pub fn restore(&self, model: &mut Model, state: &mut OptimizationState, path: &Path) -> TrainingResult<RestoredState> {
        let bytes = read_checkpoint_bytes(path)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        check_format(checkpoint.format_version)?;

        let architecture: Architecture =
            checkpoint.architecture.parse().map_err(|_| TrainingError::IncompatibleCheckpoint {
                expected: model.architecture.tag().to_string(),
                found: checkpoint.architecture.clone(),
            })?;
        if architecture != model.architecture || architecture != self.architecture {
            return Err(TrainingError::IncompatibleCheckpoint {
                expected: model.architecture.tag().to_string(),
                found: checkpoint.architecture,
            });
        }

        check_parameter_layout(&model.parameters, &checkpoint.parameters)?;

        let optimizer_restored = checkpoint.phase == state.phase();
        if optimizer_restored {
            state.optimizer_mut().load_state_dict(checkpoint.optimizer)?;
        } else {
            info!(
                saved_phase = %checkpoint.phase,
                current_phase = %state.phase(),
                "checkpoint predates the phase boundary; starting with a fresh optimizer"
            );
        }

        for (name, param) in model.parameters.iter_mut() {
            if let Some(saved) = checkpoint.parameters.get(name) {
                param.values.clone_from(&saved.values);
            }
        }

        let next_epoch = checkpoint.epoch + 1;
        info!(path = %path.display(), next_epoch, architecture = %architecture, "restored checkpoint");
        Ok(RestoredState { next_epoch, architecture, optimizer_restored })
    }

    /// Checkpoints of this architecture, oldest first.
    pub fn list(&self) -> TrainingResult<Vec<CheckpointEntry>> {
        let dir = self.layout.checkpoints_dir(self.architecture);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if let Some(epoch) = checkpoint_epoch(&path) {
                out.push(CheckpointEntry { epoch, path });
            }
        }
        out.sort_by_key(|e| e.epoch);
        Ok(out)
    }

    /// Delete the oldest checkpoints beyond the retention bound. Without a
    /// bound every checkpoint is kept.
    pub fn prune(&self) -> TrainingResult<Vec<PathBuf>> {
        let Some(keep) = self.keep_last else {
            return Ok(Vec::new());
        };
        let entries = self.list()?;
        let excess = entries.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for entry in entries.into_iter().take(excess) {
            std::fs::remove_file(&entry.path)?;
            removed.push(entry.path);
        }
        Ok(removed)
    }

    /// Record the final checkpoint (and event log, if any) in the run manifest.
    pub fn write_manifest(
        &self,
        run_id: RunId,
        start_epoch: u32,
        end_epoch: u32,
        final_checkpoint: PathBuf,
    ) -> TrainingResult<TrainingManifest> {
        let mut artifacts = vec![make_artifact(ArtifactKind::FullCheckpoint, final_checkpoint)?];
        let events = self.layout.events_path(self.architecture);
        if events.exists() {
            artifacts.push(make_artifact(ArtifactKind::Events, events)?);
        }

        let manifest = TrainingManifest {
            run_id,
            created_at: Utc::now(),
            architecture: self.architecture.tag().to_string(),
            start_epoch,
            end_epoch,
            artifacts,
        };
        let path = self.layout.manifest_path(self.architecture);
        write_atomic(&path, serde_json::to_string_pretty(&manifest)?.as_bytes())?;
        Ok(manifest)
    }
}

fn read_checkpoint_bytes(path: &Path) -> TrainingResult<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(TrainingError::CheckpointNotFound(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn check_format(version: u32) -> TrainingResult<()> {
    if version == CHECKPOINT_FORMAT_VERSION {
        Ok(())
    } else {
        Err(TrainingError::Checkpoint(format!(
            "unsupported checkpoint format version {version} (expected {CHECKPOINT_FORMAT_VERSION})"
        )))
    }
}

fn check_parameter_layout(live: &ParameterSet, saved: &ParameterSet) -> TrainingResult<()> {
    if live.len() != saved.len() {
        return Err(TrainingError::Checkpoint(format!(
            "checkpoint has {} parameters, model has {}",
            saved.len(),
            live.len()
        )));
    }
    for (name, param) in live.iter() {
        let saved = saved
            .get(name)
            .ok_or_else(|| TrainingError::Checkpoint(format!("checkpoint is missing parameter {name}")))?;
        if saved.values.len() != param.values.len() {
            return Err(TrainingError::Checkpoint(format!(
                "parameter {name} has {} values in the checkpoint, {} in the model",
                saved.values.len(),
                param.values.len()
            )));
        }
    }
    Ok(())
}

/// Write through a temporary sibling and rename, so readers never see a
/// partially written checkpoint.
fn write_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
