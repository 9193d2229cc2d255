//! Collective communication among ranks running as threads in one process.

use crate::common::*;

#[derive(Debug)]
struct Shared {
    world_size: usize,
    barrier: Barrier,
    values: Mutex<Vec<Option<String>>>,
    tensors: Mutex<Vec<Option<Vec<Tensor>>>>,
}

impl Shared {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            barrier: Barrier::new(world_size),
            values: Mutex::new(vec![None; world_size]),
            tensors: Mutex::new((0..world_size).map(|_| None).collect()),
        }
    }
}

/// A group of ranks sharing the same barrier and exchange slots.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    shared: Arc<Shared>,
}

impl ProcessGroup {
    pub fn new(world_size: usize) -> Result<Self> {
        ensure!(world_size > 0, "world size must be positive");
        Ok(Self {
            shared: Arc::new(Shared::new(world_size)),
        })
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    pub fn communicator(&self, rank: usize) -> Result<Communicator> {
        ensure!(
            rank < self.shared.world_size,
            "rank {} is out of range for world size {}",
            rank,
            self.shared.world_size
        );
        Ok(Communicator {
            rank,
            shared: self.shared.clone(),
        })
    }

    /// One communicator per rank in rank order.
    pub fn communicators(&self) -> Vec<Communicator> {
        (0..self.shared.world_size)
            .map(|rank| Communicator {
                rank,
                shared: self.shared.clone(),
            })
            .collect()
    }
}

/// The handle of one rank.
#[derive(Debug, Clone)]
pub struct Communicator {
    rank: usize,
    shared: Arc<Shared>,
}

impl Communicator {
    /// The communicator of a non-distributed run.
    pub fn single() -> Self {
        Self {
            rank: 0,
            shared: Arc::new(Shared::new(1)),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.shared.world_size
    }

    pub fn is_distributed(&self) -> bool {
        self.shared.world_size > 1
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }

    /// Block until every rank reaches this point.
    pub fn synchronize(&self) {
        if self.is_distributed() {
            self.shared.barrier.wait();
        }
    }

    /// Gather a value from every rank. The result is ordered by rank.
    pub fn all_gather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let text = serde_json::to_string(value)?;

        if !self.is_distributed() {
            return Ok(vec![serde_json::from_str(&text)?]);
        }

        self.lock_values()?[self.rank] = Some(text);
        self.shared.barrier.wait();

        let texts: Result<Vec<String>> = self
            .lock_values()?
            .iter()
            .enumerate()
            .map(|(rank, text)| {
                text.clone()
                    .ok_or_else(|| format_err!("rank {} did not provide a value", rank))
            })
            .collect();
        self.shared.barrier.wait();

        texts?
            .iter()
            .map(|text| Ok(serde_json::from_str(text)?))
            .collect()
    }

    /// Replace each tensor with its mean over all ranks.
    pub fn all_reduce_mean_(&self, tensors: &[Tensor]) -> Result<()> {
        if !self.is_distributed() {
            return Ok(());
        }
        let world_size = self.shared.world_size;

        let local: Vec<Tensor> = tensors
            .iter()
            .map(|tensor| tensor.detach().to_device(Device::Cpu).copy())
            .collect();
        self.lock_tensors()?[self.rank] = Some(local);
        self.shared.barrier.wait();

        let means: Vec<Tensor> = {
            let slots = self.lock_tensors()?;
            let slots: Vec<&Vec<Tensor>> = slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.as_ref()
                        .ok_or_else(|| format_err!("rank {} did not provide tensors", rank))
                })
                .try_collect()?;
            ensure!(
                slots.iter().all(|slot| slot.len() == tensors.len()),
                "ranks provide different numbers of tensors"
            );

            (0..tensors.len())
                .map(|index| {
                    let sum = slots
                        .iter()
                        .skip(1)
                        .fold(slots[0][index].copy(), |sum, slot| sum + &slot[index]);
                    sum / world_size as f64
                })
                .collect()
        };
        self.shared.barrier.wait();
        self.lock_tensors()?[self.rank] = None;

        tch::no_grad(|| {
            tensors.iter().zip_eq(means).for_each(|(tensor, mean)| {
                let mut tensor = tensor.shallow_clone();
                tensor.copy_(&mean.to_device(tensor.device()));
            })
        });

        Ok(())
    }

    /// Overwrite each tensor with the one from rank `src`.
    pub fn broadcast_(&self, tensors: &[Tensor], src: usize) -> Result<()> {
        if !self.is_distributed() {
            return Ok(());
        }
        ensure!(src < self.shared.world_size, "invalid source rank {}", src);

        if self.rank == src {
            let local: Vec<Tensor> = tensors
                .iter()
                .map(|tensor| tensor.detach().to_device(Device::Cpu).copy())
                .collect();
            self.lock_tensors()?[src] = Some(local);
        }
        self.shared.barrier.wait();

        let result = (|| -> Result<()> {
            if self.rank == src {
                return Ok(());
            }
            let slots = self.lock_tensors()?;
            let source = slots[src]
                .as_ref()
                .ok_or_else(|| format_err!("rank {} did not provide tensors", src))?;
            ensure!(
                source.len() == tensors.len(),
                "expect {} tensors but rank {} provides {}",
                tensors.len(),
                src,
                source.len()
            );
            tch::no_grad(|| {
                tensors.iter().zip(source).for_each(|(tensor, source)| {
                    let mut tensor = tensor.shallow_clone();
                    tensor.copy_(&source.to_device(tensor.device()));
                })
            });
            Ok(())
        })();
        self.shared.barrier.wait();

        if self.rank == src {
            self.lock_tensors()?[src] = None;
        }
        result
    }

    fn lock_values(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<String>>>> {
        self.shared
            .values
            .lock()
            .map_err(|_| format_err!("the process group is poisoned"))
    }

    fn lock_tensors(&self) -> Result<std::sync::MutexGuard<'_, Vec<Option<Vec<Tensor>>>>> {
        self.shared
            .tensors
            .lock()
            .map_err(|_| format_err!("the process group is poisoned"))
    }
}

/// Gather per-rank predictions keyed by image id onto the main process.
///
/// Non-main ranks get `None`. The result is ordered by image id.
pub fn accumulate_predictions<T>(
    comm: &Communicator,
    predictions: BTreeMap<usize, T>,
) -> Result<Option<Vec<T>>>
where
    T: Serialize + DeserializeOwned,
{
    let all_predictions = comm.all_gather(&predictions)?;
    if !comm.is_main_process() {
        return Ok(None);
    }

    let merged: BTreeMap<usize, T> = all_predictions.into_iter().flatten().collect();
    let num_images = merged.len();
    let is_contiguous = merged
        .keys()
        .enumerate()
        .all(|(expect, &image_id)| expect == image_id);

    if !is_contiguous {
        warn!(
            target: "sgg::inference",
            "Number of images that were gathered from multiple processes is not \
             a contiguous set. Some images might be missing from the evaluation"
        );
    }
    debug!("accumulated predictions of {} images", num_images);

    Ok(Some(merged.into_values().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(Communicator) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let group = ProcessGroup::new(world_size).unwrap();
        let f = Arc::new(f);
        let handles: Vec<_> = group
            .communicators()
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    }

    #[test]
    fn single_process() -> Result<()> {
        let comm = Communicator::single();
        assert!(comm.is_main_process());
        assert!(!comm.is_distributed());
        comm.synchronize();
        assert_eq!(comm.all_gather(&42usize)?, vec![42]);
        Ok(())
    }

    #[test]
    fn all_gather_in_rank_order() {
        let outputs = run_ranks(3, |comm| {
            let first = comm.all_gather(&(comm.rank() * 10)).unwrap();
            let second = comm.all_gather(&format!("rank{}", comm.rank())).unwrap();
            (first, second)
        });

        for (first, second) in outputs {
            assert_eq!(first, vec![0, 10, 20]);
            assert_eq!(second, vec!["rank0", "rank1", "rank2"]);
        }
    }

    #[test]
    fn all_reduce_mean() {
        let outputs = run_ranks(2, |comm| {
            let tensor = Tensor::of_slice(&[comm.rank() as f32 * 2.0, 4.0]);
            comm.all_reduce_mean_(&[tensor.shallow_clone()]).unwrap();
            Vec::<f32>::from(&tensor)
        });

        for values in outputs {
            assert_eq!(values, vec![1.0, 4.0]);
        }
    }

    #[test]
    fn broadcast_from_main() {
        let outputs = run_ranks(3, |comm| {
            let tensor = Tensor::of_slice(&[comm.rank() as f32 + 1.0; 2]);
            comm.broadcast_(&[tensor.shallow_clone()], 0).unwrap();
            Vec::<f32>::from(&tensor)
        });

        for values in outputs {
            assert_eq!(values, vec![1.0, 1.0]);
        }
    }

    #[test]
    fn accumulate_merges_on_main_only() {
        let outputs = run_ranks(2, |comm| {
            let predictions: BTreeMap<usize, String> = (comm.rank()..4)
                .step_by(2)
                .map(|id| (id, format!("image{}", id)))
                .collect();
            accumulate_predictions(&comm, predictions).unwrap()
        });

        assert_eq!(
            outputs[0],
            Some(vec![
                "image0".to_string(),
                "image1".into(),
                "image2".into(),
                "image3".into()
            ])
        );
        assert_eq!(outputs[1], None);
    }

    #[test]
    fn accumulate_tolerates_missing_ids() {
        let outputs = run_ranks(2, |comm| {
            let ids: &[usize] = if comm.rank() == 0 { &[5, 0] } else { &[2] };
            let predictions: BTreeMap<usize, String> = ids
                .iter()
                .map(|&id| (id, format!("image{}", id)))
                .collect();
            accumulate_predictions(&comm, predictions)
        });

        let mut outputs = outputs.into_iter();
        let main = outputs.next().unwrap().unwrap();
        assert_eq!(
            main,
            Some(vec!["image0".to_string(), "image2".into(), "image5".into()])
        );
        assert_eq!(outputs.next().unwrap().unwrap(), None);
    }
}
