use crate::architecture::Architecture;
use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

const CHECKPOINT_PREFIX: &str = "checkpoint_e";
const CHECKPOINT_EXT: &str = "json";

/// Filesystem layout for run artifacts.
///
/// Default layout is `<output_dir>/<arch_tag>/checkpoints/checkpoint_e<epoch>.json`
/// with the run manifest and event log next to the checkpoints directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn run_dir(&self, architecture: Architecture) -> PathBuf {
        self.root.join(architecture.tag())
    }

    #[must_use]
    pub fn checkpoints_dir(&self, architecture: Architecture) -> PathBuf {
        self.run_dir(architecture).join("checkpoints")
    }

    #[must_use]
    pub fn checkpoint_path(&self, architecture: Architecture, epoch: u32) -> PathBuf {
        self.checkpoints_dir(architecture)
            .join(format!("{CHECKPOINT_PREFIX}{epoch}.{CHECKPOINT_EXT}"))
    }

    #[must_use]
    pub fn manifest_path(&self, architecture: Architecture) -> PathBuf {
        self.run_dir(architecture).join("training_manifest.json")
    }

    #[must_use]
    pub fn events_path(&self, architecture: Architecture) -> PathBuf {
        self.run_dir(architecture).join("events.jsonl")
    }

    pub fn ensure_run_dirs(&self, architecture: Architecture) -> TrainingResult<()> {
        std::fs::create_dir_all(self.checkpoints_dir(architecture))?;
        Ok(())
    }
}

/// Epoch encoded in a checkpoint file name, if `path` is one.
#[must_use]
pub fn checkpoint_epoch(path: &Path) -> Option<u32> {
    if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
        return None;
    }
    path.file_stem()?.to_str()?.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}
