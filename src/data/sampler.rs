//! Per-epoch index orders.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;

/// Produces the dataset index order for one epoch.
pub trait Sampler: Send {
    fn epoch_indices(&mut self, epoch: usize) -> Vec<usize>;
}

/// Dataset order as-is.
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Sampler for SequentialSampler {
    fn epoch_indices(&mut self, _epoch: usize) -> Vec<usize> {
        (0..self.len).collect()
    }
}

/// Keeps the length-sorted order but shuffles inside buckets of `bucket` items,
/// so batches hold similar lengths without repeating the same batches.
#[derive(Debug, Clone)]
pub struct BucketSampler {
    len: usize,
    bucket: usize,
    seed: u64,
}

impl BucketSampler {
    pub fn new(len: usize, bucket: usize, seed: u64) -> Self {
        Self { len, bucket, seed }
    }
}

impl Sampler for BucketSampler {
    fn epoch_indices(&mut self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len).collect();
        if self.bucket > 1 {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            for chunk in indices.chunks_mut(self.bucket) {
                chunk.shuffle(&mut rng);
            }
        }
        indices
    }
}

/// Disjoint per-rank slices of an epoch-seeded shuffle.
///
/// Every rank shuffles `0..len` with the same seed; rank `r` of `W` keeps
/// positions `r, r + W, r + 2W, ...`. The union over ranks is the whole
/// dataset and no index is repeated.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
}

impl DistributedSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, seed: u64, shuffle: bool) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            seed,
            shuffle,
        }
    }
}

impl Sampler for DistributedSampler {
    fn epoch_indices(&mut self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
        }
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// Draws `len` indices with replacement, weighted by inverse speaker frequency.
#[derive(Debug, Clone)]
pub struct SpeakerBalancedSampler {
    weights: WeightedIndex<f64>,
    len: usize,
    seed: u64,
}

impl SpeakerBalancedSampler {
    pub fn new<'a>(speakers: impl IntoIterator<Item = &'a str>, seed: u64) -> anyhow::Result<Self> {
        let speakers: Vec<&str> = speakers.into_iter().collect();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for speaker in &speakers {
            *counts.entry(speaker).or_default() += 1;
        }
        let weights: Vec<f64> = speakers
            .iter()
            .map(|speaker| 1.0 / counts[speaker] as f64)
            .collect();
        let len = weights.len();
        let weights = WeightedIndex::new(weights)?;
        Ok(Self { weights, len, seed })
    }
}

impl Sampler for SpeakerBalancedSampler {
    fn epoch_indices(&mut self, epoch: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        (0..self.len).map(|_| self.weights.sample(&mut rng)).collect()
    }
}

/// Split an index order into batches (last batch may be short).
pub fn batches(indices: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    indices
        .chunks(batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn distributed_ranks_partition_the_dataset() {
        for (len, world) in [(10, 3), (7, 2), (5, 5), (3, 4)] {
            let mut seen = BTreeSet::new();
            let mut total = 0;
            for rank in 0..world {
                let mut sampler = DistributedSampler::new(len, rank, world, 7, true);
                let indices = sampler.epoch_indices(2);
                total += indices.len();
                seen.extend(indices);
            }
            assert_eq!(total, len, "no index repeated for len={len} world={world}");
            assert_eq!(seen, (0..len).collect::<BTreeSet<_>>());
        }
    }

    #[test]
    fn distributed_shuffle_depends_on_epoch() {
        let mut sampler = DistributedSampler::new(64, 0, 1, 1, true);
        assert_ne!(sampler.epoch_indices(0), sampler.epoch_indices(1));
        assert_eq!(sampler.epoch_indices(3), sampler.epoch_indices(3));
    }

    #[test]
    fn bucket_sampler_shuffles_within_buckets_only() {
        let mut sampler = BucketSampler::new(12, 4, 9);
        let indices = sampler.epoch_indices(0);
        for (bucket, chunk) in indices.chunks(4).enumerate() {
            let mut sorted = chunk.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, (bucket * 4..bucket * 4 + 4).collect::<Vec<_>>());
        }
    }

    #[test]
    fn balanced_sampler_favors_rare_speakers() {
        let mut speakers = vec!["common"; 99];
        speakers.push("rare");
        let mut sampler = SpeakerBalancedSampler::new(speakers.iter().copied(), 3).expect("sampler");
        let indices = sampler.epoch_indices(0);
        assert_eq!(indices.len(), 100);
        let rare = indices.iter().filter(|idx| **idx == 99).count();
        assert!(rare > 20, "rare speaker drawn {rare} times");
    }

    #[test]
    fn batches_keep_short_tail() {
        let split = batches(&[0, 1, 2, 3, 4], 2);
        assert_eq!(split, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }
}
