use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::SeedableRng;

/// Deterministic generator for (seed, epoch, index), used wherever a
/// reproducible but per-row / per-epoch independent stream is needed.
pub fn rng_for(seed: u64, epoch: u64, index: u64) -> SmallRng {
    // splitmix64-style mixing so neighbouring keys give unrelated streams
    let mut z = seed
        .wrapping_add(epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(index.wrapping_mul(0xBF58_476D_1CE4_E5B9));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    SmallRng::seed_from_u64(z ^ (z >> 31))
}

fn euclidean(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// (X, Y) matrix of euclidean distances between the rows of `a` and `b`
pub fn cdist_from_representations(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| {
        euclidean(a.row(i), b.row(j))
    })
}

/// Condensed distance vector, pairs (i, j) with i < j in row-major order
pub fn pdist_from_representations(x: &Array2<f32>) -> Array1<f32> {
    (0..x.nrows())
        .tuple_combinations()
        .map(|(i, j)| euclidean(x.row(i), x.row(j)))
        .collect()
}
