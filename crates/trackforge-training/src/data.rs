//! Epoch batch construction.
//!
//! Sample generation and collation belong to a [`SampleSource`]. This module
//! decides which sample indices this process sees in an epoch and how they
//! are grouped into batches.

use crate::error::{TrainingError, TrainingResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Produces the samples of an epoch. Implemented outside the orchestrator.
pub trait SampleSource: Send + Sync {
    type Batch: Send;

    /// Regenerate samples for `epoch` and return how many there are.
    fn prepare_epoch(&mut self, epoch: u32) -> TrainingResult<usize>;

    /// Assemble one batch from sample indices of the prepared epoch.
    fn collate(&self, indices: &[usize]) -> TrainingResult<Self::Batch>;
}

/// Process placement relevant to sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub rank: u32,
    pub world_size: u32,
    pub local_devices: usize,
}

impl Topology {
    #[must_use]
    pub fn single(local_devices: usize) -> Self {
        Self { rank: 0, world_size: 1, local_devices }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Every sample in order.
    Local,
    /// A disjoint shard per rank. The permutation depends only on `seed`,
    /// so every epoch of a run sees the same shard order.
    Partitioned { seed: u64, shuffle: bool },
}

impl SamplingStrategy {
    /// Sample indices assigned to `topology.rank`.
    #[must_use]
    pub fn indices(self, len: usize, topology: &Topology) -> Vec<usize> {
        match self {
            Self::Local => (0..len).collect(),
            Self::Partitioned { seed, shuffle } => partition(len, topology, seed, shuffle),
        }
    }
}

fn partition(len: usize, topology: &Topology, seed: u64, shuffle: bool) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let world = topology.world_size.max(1) as usize;
    let rank = topology.rank as usize;

    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }

    // Pad by wrapping around so every rank gets the same number of samples.
    let total = len.div_ceil(world) * world;
    let mut padded = order.clone();
    while padded.len() < total {
        let need = total - padded.len();
        padded.extend(order.iter().take(need));
    }

    padded.into_iter().skip(rank).step_by(world).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    /// Batch size per local device.
    pub batch_per_device: usize,
    /// Hint for sources that collate in parallel.
    pub workers: usize,
    pub seed: u64,
}

/// Builds each epoch's batch iterator from a [`SampleSource`].
#[derive(Debug)]
pub struct DataPipelineAdapter<S> {
    source: S,
    options: LoaderOptions,
}

impl<S: SampleSource> DataPipelineAdapter<S> {
    pub fn new(source: S, options: LoaderOptions) -> TrainingResult<Self> {
        if options.batch_per_device == 0 {
            return Err(TrainingError::Data("batch size must be >= 1".to_string()));
        }
        Ok(Self { source, options })
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Strategy used for `topology`: partitioned when more than one rank exists.
    #[must_use]
    pub fn strategy_for(&self, topology: &Topology) -> SamplingStrategy {
        if topology.world_size > 1 {
            SamplingStrategy::Partitioned { seed: self.options.seed, shuffle: true }
        } else {
            SamplingStrategy::Local
        }
    }

    /// Prepare `epoch` and return its batches. The trailing partial batch is dropped.
    pub fn iterator(&mut self, epoch: u32, topology: &Topology) -> TrainingResult<EpochBatches<'_, S>> {
        let len = self.source.prepare_epoch(epoch)?;
        let strategy = self.strategy_for(topology);
        let batch_size = self.options.batch_per_device * topology.local_devices.max(1);
        let indices = strategy.indices(len, topology);
        let plan: Vec<Vec<usize>> = indices.chunks_exact(batch_size).map(<[usize]>::to_vec).collect();

        debug!(
            epoch,
            samples = len,
            shard = indices.len(),
            batch_size,
            batches = plan.len(),
            workers = self.options.workers,
            ?strategy,
            "epoch batches planned"
        );
        Ok(EpochBatches { source: &self.source, plan: plan.into_iter(), batch_size })
    }
}

/// Batches of one epoch, collated lazily.
#[derive(Debug)]
pub struct EpochBatches<'a, S> {
    source: &'a S,
    plan: std::vec::IntoIter<Vec<usize>>,
    batch_size: usize,
}

impl<S> EpochBatches<'_, S> {
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<S: SampleSource> Iterator for EpochBatches<'_, S> {
    type Item = TrainingResult<S::Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.plan.next()?;
        Some(self.source.collate(&indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.plan.size_hint()
    }
}

impl<S: SampleSource> ExactSizeIterator for EpochBatches<'_, S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[derive(Debug)]
    struct Indices {
        len: usize,
        prepared: Vec<u32>,
    }

    impl SampleSource for Indices {
        type Batch = Vec<usize>;

        fn prepare_epoch(&mut self, epoch: u32) -> TrainingResult<usize> {
            self.prepared.push(epoch);
            Ok(self.len)
        }

        fn collate(&self, indices: &[usize]) -> TrainingResult<Vec<usize>> {
            Ok(indices.to_vec())
        }
    }

    fn adapter(len: usize, batch: usize) -> DataPipelineAdapter<Indices> {
        DataPipelineAdapter::new(
            Indices { len, prepared: Vec::new() },
            LoaderOptions { batch_per_device: batch, workers: 0, seed: 42 },
        )
        .unwrap()
    }

    #[test]
    fn test_local_strategy_drops_last_partial_batch() {
        let mut data = adapter(10, 3);
        let batches: Vec<_> = data.iterator(0, &Topology::single(1)).unwrap().map(Result::unwrap).collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]]);
        assert_eq!(data.source().prepared, vec![0]);
    }

    #[test]
    fn test_batch_scales_with_local_devices() {
        let mut data = adapter(10, 2);
        let batches = data.iterator(0, &Topology::single(2)).unwrap();
        assert_eq!(batches.batch_size(), 4);
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn test_partitions_are_disjoint_and_cover_dataset() {
        let len = 11;
        let shards: Vec<Vec<usize>> = (0..3)
            .map(|rank| {
                let topology = Topology { rank, world_size: 3, local_devices: 1 };
                SamplingStrategy::Partitioned { seed: 42, shuffle: true }.indices(len, &topology)
            })
            .collect();

        assert!(shards.iter().all(|s| s.len() == 4));
        let covered: BTreeSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(covered.len(), len);
    }

    #[test]
    fn test_partition_seed_is_fixed_across_epochs() {
        let mut data = adapter(64, 4);
        let topology = Topology { rank: 1, world_size: 2, local_devices: 1 };
        let first: Vec<_> = data.iterator(0, &topology).unwrap().map(Result::unwrap).collect();
        let second: Vec<_> = data.iterator(1, &topology).unwrap().map(Result::unwrap).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_rank_partition_matches_local_batch_count() {
        for len in [0, 1, 7, 32, 33] {
            let topology = Topology::single(1);
            let local = SamplingStrategy::Local.indices(len, &topology);
            let partitioned = SamplingStrategy::Partitioned { seed: 42, shuffle: true }.indices(len, &topology);
            assert_eq!(local.len() / 4, partitioned.len() / 4);
        }
    }

    #[test]
    fn test_zero_batch_is_rejected() {
        let err = DataPipelineAdapter::new(
            Indices { len: 1, prepared: Vec::new() },
            LoaderOptions { batch_per_device: 0, workers: 0, seed: 1 },
        )
        .unwrap_err();
        assert!(matches!(err, TrainingError::Data(_)));
    }
}
