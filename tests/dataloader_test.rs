mod common;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tcrlm::{
    BatchCollator, CollatedBatch, CollationObjective, DoubleDatasetDataLoader, ReferenceGeneTable,
    Sampler, SingleDatasetDataLoader, TcrDataLoader, TcrDataset, TcrRow, TcrTable, Tokeniser,
};

fn dataset(table: &TcrTable) -> Arc<TcrDataset> {
    Arc::new(TcrDataset::from_table(table, ReferenceGeneTable::builtin()).unwrap())
}

fn default_collator() -> BatchCollator {
    BatchCollator::new(
        Tokeniser::from_name("CdrTokeniser").unwrap(),
        CollationObjective::Default,
    )
}

fn shuffled(seed: u64) -> Sampler {
    Sampler {
        shuffle: true,
        seed,
        ..Default::default()
    }
}

#[test]
fn unshuffled_loader_walks_the_dataset_in_order() -> Result<()> {
    let loader = SingleDatasetDataLoader::new(
        dataset(&common::paired_table()),
        default_collator(),
        3,
        Sampler::default(),
    );
    assert_eq!(loader.len(), 2);
    assert_eq!(loader.batch_indices(), vec![vec![0, 1, 2], vec![3]]);

    let shapes: Vec<usize> = loader
        .batches()
        .map(|b| match b? {
            CollatedBatch::Default(batch) => Ok(batch.shape()[0]),
            other => panic!("unexpected batch {:?}", other),
        })
        .collect::<Result<_>>()?;
    assert_eq!(shapes, vec![3, 1]);
    Ok(())
}

#[test]
fn shuffling_is_a_permutation_fixed_by_seed_and_epoch() {
    let mut loader = SingleDatasetDataLoader::new(
        dataset(&common::paired_table()),
        default_collator(),
        4,
        shuffled(5),
    );
    let epoch_0 = loader.batch_indices();
    assert_eq!(loader.batch_indices(), epoch_0);
    let visited: HashSet<usize> = epoch_0.concat().into_iter().collect();
    assert_eq!(visited, HashSet::from([0, 1, 2, 3]));

    loader.set_epoch(3);
    assert_eq!(loader.epoch(), 3);
    let epoch_3 = loader.batch_indices();
    loader.set_epoch(0);
    assert_eq!(loader.batch_indices(), epoch_0);
    assert_eq!(epoch_3.concat().len(), 4);
}

#[test]
fn seed_and_epoch_do_not_alias() {
    let len = 32;
    let seed_0_epoch_1 = shuffled(0).indices(len, 1);
    let seed_1_epoch_0 = shuffled(1).indices(len, 0);
    assert_ne!(seed_0_epoch_1, seed_1_epoch_0);
    assert_ne!(shuffled(0).indices(len, 0), seed_1_epoch_0);
}

#[test]
fn replicas_split_a_padded_epoch() {
    let len = 5;
    let mut seen = vec![];
    for rank in 0..2 {
        let sampler = Sampler {
            num_replicas: 2,
            rank,
            ..Default::default()
        };
        let indices = sampler.indices(len, 0);
        assert_eq!(indices.len(), 3);
        seen.extend(indices);
    }
    seen.sort();
    // index 0 is reused to pad 5 up to 6
    assert_eq!(seen, vec![0, 0, 1, 2, 3, 4]);
}

#[test]
fn double_loader_cycles_the_shorter_dataset() -> Result<()> {
    let paired = common::paired_table();
    let beta = common::beta_only_table();
    let collator = BatchCollator::new(
        Tokeniser::from_name("BetaCdrTokeniser").unwrap(),
        CollationObjective::Default,
    );
    let loader = DoubleDatasetDataLoader::new(
        dataset(&paired),
        dataset(&beta),
        collator,
        1,
        2,
        Sampler::default(),
    );

    // four batches from the first dataset, two from the second
    assert_eq!(loader.len(), 4);
    let indices = loader.batch_indices();
    assert_eq!(indices.len(), 4);
    assert_eq!(indices[0], (vec![0], vec![0, 1]));
    assert_eq!(indices[1], (vec![1], vec![2]));
    assert_eq!(indices[2], (vec![2], vec![0, 1]));
    assert_eq!(indices[3], (vec![3], vec![2]));

    let sizes: Vec<usize> = loader
        .batches()
        .map(|b| match b? {
            CollatedBatch::Default(batch) => Ok(batch.shape()[0]),
            other => panic!("unexpected batch {:?}", other),
        })
        .collect::<Result<_>>()?;
    assert_eq!(sizes, vec![3, 2, 3, 2]);
    Ok(())
}

#[test]
fn double_loader_with_an_empty_side_is_empty() {
    let loader = DoubleDatasetDataLoader::new(
        dataset(&common::paired_table()),
        Arc::new(TcrDataset::default()),
        default_collator(),
        2,
        2,
        Sampler::default(),
    );
    assert!(loader.is_empty());
    assert_eq!(loader.batches().count(), 0);
}

#[test]
fn noised_batches_repeat_within_an_epoch() -> Result<()> {
    let collator = BatchCollator::new(
        Tokeniser::from_name("CdrTokeniser").unwrap(),
        CollationObjective::Mlm,
    );
    let loader = SingleDatasetDataLoader::new(
        dataset(&common::paired_table()),
        collator,
        2,
        shuffled(11),
    );
    let first: Vec<CollatedBatch> = loader.batches().collect::<Result<_>>()?;
    let second: Vec<CollatedBatch> = loader.batches().collect::<Result<_>>()?;
    for (a, b) in first.iter().zip(second.iter()) {
        match (a, b) {
            (
                CollatedBatch::Mlm { masked: m1, target: t1 },
                CollatedBatch::Mlm { masked: m2, target: t2 },
            ) => {
                assert_eq!(m1, m2);
                assert_eq!(t1, t2);
            }
            _ => panic!("expected MLM batches"),
        }
    }
    Ok(())
}

#[test]
fn bad_rows_are_reported_with_their_dataset_index() {
    let table = TcrTable::new(vec![
        TcrRow::new(None, None, Some("TRBV2*01"), Some("CASSEFQGDNEQFF")),
        TcrRow::new(None, None, Some("TRBV9*01"), Some("CASSVGDLLTGELFF")),
        TcrRow::new(Some("TRAV3*01"), Some("CAVDNARLMF"), None, None),
    ]);
    let collator = BatchCollator::new(
        Tokeniser::from_name("BetaCdr3Tokeniser").unwrap(),
        CollationObjective::Default,
    );
    let loader = SingleDatasetDataLoader::new(dataset(&table), collator, 2, Sampler::default());
    let results: Vec<Result<CollatedBatch>> = loader.batches().collect();
    assert!(results[0].is_ok());
    let err = results[1].as_ref().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<tcrlm::TcrlmError>(),
        Some(tcrlm::TcrlmError::MissingInput { row: 2, .. })
    ));
}
