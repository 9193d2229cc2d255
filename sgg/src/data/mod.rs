//! Dataset loading, preprocessing and batching.

mod dataset;
pub use dataset::*;

mod loader;
pub use loader::*;

mod transforms;
pub use transforms::*;

use crate::{comm::Communicator, common::*, config::Config};

/// The split a data loader serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Build the data loader of a split for the rank of `comm`.
///
/// The configured batch size is the global one and is divided among ranks.
pub fn make_data_loader(
    config: &Config,
    split: Split,
    comm: &Communicator,
    start_iter: usize,
) -> Result<DataLoader> {
    let world_size = comm.world_size();
    let rank = comm.rank();

    let (split_config, transforms, global_batch) = match split {
        Split::Train => (
            &config.dataset.train,
            Transforms::for_training(&config.input),
            config.solver.ims_per_batch.get(),
        ),
        Split::Test => (
            &config.dataset.test,
            Transforms::for_testing(&config.input),
            config.test.ims_per_batch.get(),
        ),
    };
    ensure!(
        global_batch % world_size == 0,
        "batch size ({}) must be divisible by the number of ranks ({})",
        global_batch,
        world_size
    );
    let batch_size = global_batch / world_size;

    let dataset = Arc::new(SceneDataset::open(
        split_config,
        transforms,
        split == Split::Train,
    )?);

    let sampler = match split {
        Split::Train => BatchSampler::Iteration(IterationBasedBatchSampler::new(
            dataset.len(),
            batch_size,
            rank,
            world_size,
            config.dataloader.shuffle_seed,
            start_iter,
            config.solver.max_iter,
        )?),
        Split::Test => BatchSampler::Sequential(SequentialBatchSampler::new(
            dataset.len(),
            batch_size,
            rank,
            world_size,
        )?),
    };

    Ok(DataLoader::new(
        dataset,
        sampler,
        config.dataloader.size_divisibility,
        config.dataloader.prefetch,
    ))
}
