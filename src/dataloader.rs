//! Datasets and epoch-aware loaders feeding collated batches.
use crate::collator::{BatchCollator, CollatedBatch};
use crate::shared::{rng_for, GeneOracle, TcrPmhcPair, TcrTable};
use anyhow::Result;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Generator index reserved for the epoch shuffle, apart from the
/// per-step collation streams.
const SHUFFLE_STREAM: u64 = u64::MAX;

#[derive(Clone, Debug, Default)]
pub struct TcrDataset {
    pairs: Vec<TcrPmhcPair>,
}

impl TcrDataset {
    pub fn new(pairs: Vec<TcrPmhcPair>) -> TcrDataset {
        TcrDataset { pairs }
    }

    pub fn from_table(table: &TcrTable, oracle: &dyn GeneOracle) -> Result<TcrDataset> {
        Ok(TcrDataset {
            pairs: table.generate_tcr_pmhc_series(oracle)?,
        })
    }

    pub fn from_csv_path(path: &Path, oracle: &dyn GeneOracle) -> Result<TcrDataset> {
        let table = TcrTable::from_csv_path(path)?;
        log::debug!("Read {} rows from {}", table.len(), path.display());
        TcrDataset::from_table(&table, oracle)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TcrPmhcPair> {
        self.pairs.get(index)
    }
}

/// Order in which one replica visits a dataset during an epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sampler {
    pub shuffle: bool,
    pub seed: u64,
    pub num_replicas: usize,
    pub rank: usize,
}

impl Default for Sampler {
    fn default() -> Sampler {
        Sampler {
            shuffle: false,
            seed: 0,
            num_replicas: 1,
            rank: 0,
        }
    }
}

impl Sampler {
    /// Shuffled with a generator keyed on (seed, epoch), padded by wrapping
    /// around so every replica gets the same count, then every
    /// `num_replicas`-th index starting at `rank`.
    pub fn indices(&self, dataset_len: usize, epoch: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..dataset_len).collect();
        if self.shuffle {
            let mut rng = rng_for(self.seed, epoch, SHUFFLE_STREAM);
            indices.shuffle(&mut rng);
        }
        if dataset_len == 0 {
            return indices;
        }

        let num_replicas = self.num_replicas.max(1);
        let total_size = dataset_len.div_ceil(num_replicas) * num_replicas;
        let mut padded = indices.clone();
        while padded.len() < total_size {
            let missing = total_size - padded.len();
            padded.extend(indices.iter().take(missing));
        }
        padded
            .into_iter()
            .skip(self.rank)
            .step_by(num_replicas)
            .collect()
    }
}

pub trait TcrDataLoader {
    /// Number of batches per epoch
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_epoch(&mut self, epoch: u64);

    fn batches(&self) -> Box<dyn Iterator<Item = Result<CollatedBatch>> + '_>;
}

#[derive(Clone, Debug)]
pub struct SingleDatasetDataLoader {
    dataset: Arc<TcrDataset>,
    batch_collator: BatchCollator,
    batch_size: usize,
    sampler: Sampler,
    epoch: u64,
}

impl SingleDatasetDataLoader {
    pub fn new(
        dataset: Arc<TcrDataset>,
        batch_collator: BatchCollator,
        batch_size: usize,
        sampler: Sampler,
    ) -> SingleDatasetDataLoader {
        SingleDatasetDataLoader {
            dataset,
            batch_collator,
            batch_size: batch_size.max(1),
            sampler,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Dataset indices of every batch of the current epoch
    pub fn batch_indices(&self) -> Vec<Vec<usize>> {
        self.sampler
            .indices(self.dataset.len(), self.epoch)
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect()
    }
}

impl TcrDataLoader for SingleDatasetDataLoader {
    fn len(&self) -> usize {
        self.sampler
            .indices(self.dataset.len(), self.epoch)
            .len()
            .div_ceil(self.batch_size)
    }

    fn set_epoch(&mut self, epoch: u64) {
        log::debug!("Data loader moving to epoch {}", epoch);
        self.epoch = epoch;
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<CollatedBatch>> + '_> {
        Box::new(
            self.batch_indices()
                .into_iter()
                .enumerate()
                .map(move |(step, rows)| {
                    let pairs = gather(&self.dataset, &rows);
                    let mut rng = rng_for(self.sampler.seed, self.epoch, step as u64);
                    self.batch_collator.collate_rows(&pairs, &rows, &mut rng)
                }),
        )
    }
}

fn gather(dataset: &TcrDataset, rows: &[usize]) -> Vec<TcrPmhcPair> {
    rows.iter()
        .filter_map(|&i| dataset.get(i).cloned())
        .collect()
}

/// Co-iterates two datasets. The loader with more batches sets the epoch
/// length, the other restarts from its first batch whenever it runs out.
/// Every step collates batch 1 followed by batch 2 as one batch.
#[derive(Clone, Debug)]
pub struct DoubleDatasetDataLoader {
    dataset_1: Arc<TcrDataset>,
    dataset_2: Arc<TcrDataset>,
    batch_collator: BatchCollator,
    batch_size_1: usize,
    batch_size_2: usize,
    sampler: Sampler,
    epoch: u64,
}

impl DoubleDatasetDataLoader {
    pub fn new(
        dataset_1: Arc<TcrDataset>,
        dataset_2: Arc<TcrDataset>,
        batch_collator: BatchCollator,
        batch_size_1: usize,
        batch_size_2: usize,
        sampler: Sampler,
    ) -> DoubleDatasetDataLoader {
        DoubleDatasetDataLoader {
            dataset_1,
            dataset_2,
            batch_collator,
            batch_size_1: batch_size_1.max(1),
            batch_size_2: batch_size_2.max(1),
            sampler,
            epoch: 0,
        }
    }

    fn batches_of(&self, dataset: &TcrDataset, batch_size: usize, stream: u64) -> Vec<Vec<usize>> {
        // the two datasets are shuffled with distinct generators
        let sampler = Sampler {
            seed: self.sampler.seed.wrapping_add(stream << 32),
            ..self.sampler
        };
        sampler
            .indices(dataset.len(), self.epoch)
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect()
    }

    /// Pairs of (batch 1, batch 2) dataset indices for the current epoch
    pub fn batch_indices(&self) -> Vec<(Vec<usize>, Vec<usize>)> {
        let batches_1 = self.batches_of(&self.dataset_1, self.batch_size_1, 0);
        let batches_2 = self.batches_of(&self.dataset_2, self.batch_size_2, 1);
        if batches_1.is_empty() || batches_2.is_empty() {
            return vec![];
        }
        let num_steps = batches_1.len().max(batches_2.len());
        (0..num_steps)
            .map(|step| {
                (
                    batches_1[step % batches_1.len()].clone(),
                    batches_2[step % batches_2.len()].clone(),
                )
            })
            .collect()
    }
}

impl TcrDataLoader for DoubleDatasetDataLoader {
    fn len(&self) -> usize {
        let len_1 = self.batches_of(&self.dataset_1, self.batch_size_1, 0).len();
        let len_2 = self.batches_of(&self.dataset_2, self.batch_size_2, 1).len();
        if len_1 == 0 || len_2 == 0 {
            0
        } else {
            len_1.max(len_2)
        }
    }

    fn set_epoch(&mut self, epoch: u64) {
        log::debug!("Double data loader moving to epoch {}", epoch);
        self.epoch = epoch;
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<CollatedBatch>> + '_> {
        Box::new(
            self.batch_indices()
                .into_iter()
                .enumerate()
                .map(move |(step, (rows_1, rows_2))| {
                    let mut pairs = gather(&self.dataset_1, &rows_1);
                    pairs.extend(gather(&self.dataset_2, &rows_2));
                    let rows: Vec<usize> = rows_1.iter().chain(rows_2.iter()).copied().collect();
                    let mut rng = rng_for(self.sampler.seed, self.epoch, step as u64);
                    self.batch_collator.collate_rows(&pairs, &rows, &mut rng)
                }),
        )
    }
}
