//! Run configuration.
//!
//! A run is described by a single TOML file with `[model]`, `[common]` and
//! `[train]` tables. The file is read once; nothing downstream mutates it.

use crate::architecture::Architecture;
use crate::device::DeviceList;
use crate::distributed::Backend;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub common: CommonConfig,
    pub train: TrainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture identifier, e.g. `Ocean` or `SiamFC`.
    pub name: String,
    /// Parameter snapshot used to initialize the model before training.
    #[serde(default)]
    pub pretrained: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Comma separated accelerator ids. Empty means CPU only.
    #[serde(default)]
    pub gpus: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Seed for partitioned sampling. Held fixed for every epoch of a run.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self { gpus: String::new(), output_dir: default_output_dir(), seed: default_seed() }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Batch size per local device.
    pub batch: u32,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub start_epoch: u32,
    /// Exclusive upper bound of the epoch range.
    pub end_epoch: u32,
    /// Epoch at which the backbone is unfrozen.
    #[serde(default)]
    pub unfix_epoch: Option<u32>,
    #[serde(default)]
    pub resume: Option<PathBuf>,
    /// Number of most recent checkpoints to keep. `None` keeps all of them.
    #[serde(default)]
    pub keep_last: Option<usize>,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    pub lr: ScheduleConfig,
    #[serde(default)]
    pub warmup: Option<WarmupConfig>,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub ddp: DdpConfig,
}

fn default_workers() -> u32 {
    4
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    1e-4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Log,
    Step,
    MultiStep,
    Linear,
    Cos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    pub start_lr: f64,
    #[serde(default)]
    pub end_lr: Option<f64>,
    /// Epochs between decays for `step`.
    #[serde(default)]
    pub step: Option<u32>,
    /// Decay factor for `step` and `multi_step`.
    #[serde(default)]
    pub mult: Option<f64>,
    /// Decay epochs for `multi_step`.
    #[serde(default)]
    pub milestones: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Number of warmup epochs taken from the front of the run.
    pub epoch: u32,
    #[serde(flatten)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Backbone layers unfrozen in the full phase. Empty unfreezes the whole backbone.
    #[serde(default)]
    pub train_layers: Vec<String>,
    /// Backbone learning rate relative to the head.
    #[serde(default = "default_layers_lr")]
    pub layers_lr: f64,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self { train_layers: Vec::new(), layers_lr: default_layers_lr() }
    }
}

fn default_layers_lr() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rank: u32,
    #[serde(default = "default_world_size")]
    pub world_size: u32,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rank: 0,
            world_size: default_world_size(),
            backend: default_backend(),
            master_addr: default_master_addr(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_world_size() -> u32 {
    1
}

fn default_backend() -> String {
    "tcp".to_string()
}

fn default_master_addr() -> String {
    "127.0.0.1:29500".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl RunConfig {
    /// Load a run configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        if !path.exists() {
            return Err(TrainingError::InvalidConfig(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> TrainingResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve the configured architecture identifier.
    pub fn architecture(&self) -> TrainingResult<Architecture> {
        self.model.name.parse()
    }

    pub fn devices(&self) -> TrainingResult<DeviceList> {
        self.common.gpus.parse()
    }

    /// The warm to full boundary, if this run has one.
    #[must_use]
    pub fn phase_boundary(&self) -> Option<u32> {
        self.train.unfix_epoch
    }

    pub fn validate(&self) -> TrainingResult<()> {
        let train = &self.train;
        if train.end_epoch <= train.start_epoch {
            return Err(TrainingError::InvalidConfig(format!(
                "end_epoch ({}) must be greater than start_epoch ({})",
                train.end_epoch, train.start_epoch
            )));
        }
        if train.batch == 0 {
            return Err(TrainingError::InvalidConfig("batch must be >= 1".to_string()));
        }
        if train.keep_last == Some(0) {
            return Err(TrainingError::InvalidConfig("keep_last must be >= 1".to_string()));
        }
        validate_schedule("lr", &train.lr)?;
        if let Some(warmup) = &train.warmup {
            validate_schedule("warmup", &warmup.schedule)?;
            if warmup.epoch >= train.end_epoch {
                return Err(TrainingError::InvalidConfig(format!(
                    "warmup.epoch ({}) must be less than end_epoch ({})",
                    warmup.epoch, train.end_epoch
                )));
            }
        }
        if !(train.backbone.layers_lr.is_finite() && train.backbone.layers_lr > 0.0) {
            return Err(TrainingError::InvalidConfig("backbone.layers_lr must be > 0".to_string()));
        }

        let ddp = &train.ddp;
        Backend::parse(&ddp.backend)?;
        if ddp.enabled {
            if ddp.world_size == 0 {
                return Err(TrainingError::InvalidConfig("ddp.world_size must be >= 1".to_string()));
            }
            if ddp.rank >= ddp.world_size {
                return Err(TrainingError::InvalidConfig(format!(
                    "ddp.rank ({}) must be less than ddp.world_size ({})",
                    ddp.rank, ddp.world_size
                )));
            }
        }
        self.devices()?;
        Ok(())
    }
}

fn validate_schedule(name: &str, schedule: &ScheduleConfig) -> TrainingResult<()> {
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if !positive(schedule.start_lr) {
        return Err(TrainingError::InvalidConfig(format!("{name}.start_lr must be > 0")));
    }
    if let Some(end) = schedule.end_lr {
        if !positive(end) {
            return Err(TrainingError::InvalidConfig(format!("{name}.end_lr must be > 0")));
        }
    }
    match schedule.kind {
        ScheduleKind::Log | ScheduleKind::Linear | ScheduleKind::Cos if schedule.end_lr.is_none() => {
            Err(TrainingError::InvalidConfig(format!("{name}.end_lr is required for {:?}", schedule.kind)))
        }
        ScheduleKind::Step if schedule.step.unwrap_or(0) == 0 => {
            Err(TrainingError::InvalidConfig(format!("{name}.step must be >= 1")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [model]
        name = "Ocean"

        [train]
        batch = 8
        end_epoch = 3
        unfix_epoch = 1

        [train.lr]
        kind = "log"
        start_lr = 0.01
        end_lr = 0.0001
    "#;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = RunConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.common.seed, 42);
        assert_eq!(config.train.workers, 4);
        assert_eq!(config.train.start_epoch, 0);
        assert!(!config.train.ddp.enabled);
        assert_eq!(config.train.ddp.world_size, 1);
        assert_eq!(config.phase_boundary(), Some(1));
        config.validate().unwrap();
    }

    #[test]
    fn test_warmup_schedule_is_flattened() {
        let text = format!(
            "{MINIMAL}\n[train.warmup]\nepoch = 1\nkind = \"step\"\nstart_lr = 0.001\nstep = 1\nmult = 2.0\n"
        );
        let config = RunConfig::from_toml_str(&text).unwrap();
        let warmup = config.train.warmup.as_ref().unwrap();
        assert_eq!(warmup.epoch, 1);
        assert_eq!(warmup.schedule.kind, ScheduleKind::Step);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_epoch_range() {
        let mut config = RunConfig::from_toml_str(MINIMAL).unwrap();
        config.train.start_epoch = 3;
        assert!(matches!(config.validate(), Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_rank_outside_world() {
        let mut config = RunConfig::from_toml_str(MINIMAL).unwrap();
        config.train.ddp.enabled = true;
        config.train.ddp.world_size = 2;
        config.train.ddp.rank = 2;
        assert!(matches!(config.validate(), Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut config = RunConfig::from_toml_str(MINIMAL).unwrap();
        config.train.ddp.backend = "mpi".to_string();
        assert!(matches!(config.validate(), Err(TrainingError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = RunConfig::load_from_file(Path::new("/nonexistent/run.toml")).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidConfig(_)));
    }
}
