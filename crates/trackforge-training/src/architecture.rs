use crate::error::TrainingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tracker architectures this trainer knows how to optimize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    SiamFc,
    SiamDw,
    Ocean,
    OceanPlus,
    AutoMatch,
    TransT,
}

/// How the learning rate for an epoch is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrStrategy {
    /// A precomputed per-epoch table written into every param group.
    Table,
    /// A stateful schedule advanced once per epoch, scaled per group.
    Scheduler,
}

impl Architecture {
    pub const ALL: [Self; 6] =
        [Self::SiamFc, Self::SiamDw, Self::Ocean, Self::OceanPlus, Self::AutoMatch, Self::TransT];

    /// Stable tag written into checkpoints and used in on-disk paths.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::SiamFc => "SiamFC",
            Self::SiamDw => "SiamDW",
            Self::Ocean => "Ocean",
            Self::OceanPlus => "OceanPlus",
            Self::AutoMatch => "AutoMatch",
            Self::TransT => "TransT",
        }
    }

    #[must_use]
    pub fn lr_strategy(self) -> LrStrategy {
        match self {
            Self::SiamFc | Self::SiamDw => LrStrategy::Table,
            Self::Ocean | Self::OceanPlus | Self::AutoMatch | Self::TransT => LrStrategy::Scheduler,
        }
    }

    /// Whether training starts with the backbone frozen.
    #[must_use]
    pub fn has_warm_phase(self) -> bool {
        self.lr_strategy() == LrStrategy::Scheduler
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Architecture {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|arch| arch.tag().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| TrainingError::UnsupportedArchitecture(wanted.to_string()))
    }
}
