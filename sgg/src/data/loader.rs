//! Batch sampling and background batch loading.

use super::dataset::SceneDataset;
use crate::common::*;
use std::thread;

/// A collated batch.
#[derive(Debug)]
pub struct Batch {
    pub images: ImageList,
    pub targets: Vec<Annotation>,
    pub image_ids: Vec<usize>,
}

/// Yields a fixed number of batches, reshuffling the dataset at every epoch.
///
/// Batch `i` is always the same for the same seed, so resuming at `start_iter`
/// continues the exact sequence.
#[derive(Debug, Clone)]
pub struct IterationBasedBatchSampler {
    dataset_len: usize,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    start_iter: usize,
    max_iter: usize,
}

impl IterationBasedBatchSampler {
    pub fn new(
        dataset_len: usize,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        seed: u64,
        start_iter: usize,
        max_iter: usize,
    ) -> Result<Self> {
        ensure!(dataset_len > 0, "the dataset is empty");
        ensure!(batch_size > 0, "batch size must be positive");
        ensure!(rank < world_size, "rank {} >= world size {}", rank, world_size);

        Ok(Self {
            dataset_len,
            batch_size,
            rank,
            world_size,
            seed,
            start_iter,
            max_iter,
        })
    }

    /// The number of samples this rank sees in an epoch. Shards are padded to equal length.
    fn shard_len(&self) -> usize {
        (self.dataset_len + self.world_size - 1) / self.world_size
    }

    fn batches_per_epoch(&self) -> usize {
        (self.shard_len() + self.batch_size - 1) / self.batch_size
    }

    /// The indices of this rank in the given epoch.
    fn epoch_shard(&self, epoch: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();
        indices.shuffle(&mut rng);

        let total = self.shard_len() * self.world_size;
        let padding: Vec<usize> = indices
            .iter()
            .cycle()
            .take(total - self.dataset_len)
            .copied()
            .collect();
        indices.extend(padding);

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Iterate `(iteration, indices)` pairs from `start_iter` until `max_iter`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Vec<usize>)> {
        let sampler = self.clone();
        let batches_per_epoch = self.batches_per_epoch();
        let mut current_epoch = None;
        let mut shard = vec![];

        (self.start_iter..self.max_iter).map(move |iteration| {
            let epoch = iteration / batches_per_epoch;
            let position = iteration % batches_per_epoch;

            if current_epoch != Some(epoch) {
                shard = sampler.epoch_shard(epoch);
                current_epoch = Some(epoch);
            }

            let begin = position * sampler.batch_size;
            let end = (begin + sampler.batch_size).min(shard.len());
            (iteration, shard[begin..end].to_vec())
        })
    }

    pub fn len(&self) -> usize {
        self.max_iter
    }

    pub fn is_empty(&self) -> bool {
        self.max_iter == 0
    }
}

/// Yields the rank's shard in order once.
#[derive(Debug, Clone)]
pub struct SequentialBatchSampler {
    indices: Vec<usize>,
    batch_size: usize,
}

impl SequentialBatchSampler {
    pub fn new(dataset_len: usize, batch_size: usize, rank: usize, world_size: usize) -> Result<Self> {
        ensure!(batch_size > 0, "batch size must be positive");
        ensure!(rank < world_size, "rank {} >= world size {}", rank, world_size);

        let indices = (rank..dataset_len).step_by(world_size).collect();
        Ok(Self {
            indices,
            batch_size,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Vec<usize>)> + '_ {
        self.indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .enumerate()
    }

    pub fn len(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum BatchSampler {
    Iteration(IterationBasedBatchSampler),
    Sequential(SequentialBatchSampler),
}

impl BatchSampler {
    fn batches(&self) -> Vec<(usize, Vec<usize>)> {
        match self {
            Self::Iteration(sampler) => sampler.iter().collect(),
            Self::Sequential(sampler) => sampler.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Iteration(sampler) => sampler.len(),
            Self::Sequential(sampler) => sampler.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loads batches on a background thread.
#[derive(Debug)]
pub struct DataLoader {
    dataset: Arc<SceneDataset>,
    sampler: BatchSampler,
    size_divisibility: usize,
    prefetch: usize,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<SceneDataset>,
        sampler: BatchSampler,
        size_divisibility: usize,
        prefetch: usize,
    ) -> Self {
        Self {
            dataset,
            sampler,
            size_divisibility,
            prefetch,
        }
    }

    pub fn dataset(&self) -> &Arc<SceneDataset> {
        &self.dataset
    }

    pub fn sampler(&self) -> &BatchSampler {
        &self.sampler
    }

    /// The number of batches in a full pass. For training it is the total iteration count.
    pub fn len(&self) -> usize {
        self.sampler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sampler.is_empty()
    }

    /// Iterate `(iteration, batch)` pairs. Loading stops as soon as the iterator is dropped.
    pub fn iter(&self) -> impl Iterator<Item = Result<(usize, Batch)>> {
        let (tx, rx) = flume::bounded(self.prefetch.max(1));
        let dataset = self.dataset.clone();
        let batches = self.sampler.batches();
        let size_divisibility = self.size_divisibility;

        thread::spawn(move || {
            for (iteration, indices) in batches {
                let result = load_batch(&dataset, &indices, size_divisibility)
                    .map(|batch| (iteration, batch));
                let is_err = result.is_err();

                if tx.send(result).is_err() || is_err {
                    break;
                }
            }
        });

        rx.into_iter()
    }
}

fn load_batch(dataset: &SceneDataset, indices: &[usize], size_divisibility: usize) -> Result<Batch> {
    let samples: Vec<_> = indices
        .iter()
        .map(|&index| dataset.get(index))
        .try_collect()?;

    let (images, targets, image_ids) = samples.into_iter().fold(
        (vec![], vec![], vec![]),
        |(mut images, mut targets, mut image_ids), sample| {
            images.push(sample.image);
            targets.push(sample.annotation);
            image_ids.push(sample.image_id);
            (images, targets, image_ids)
        },
    );
    let images = ImageList::from_tensors(&images, size_divisibility)?;

    Ok(Batch {
        images,
        targets,
        image_ids,
    })
}
