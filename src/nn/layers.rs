//! Dense building blocks and the named-parameter protocol used for
//! state-dict (de)serialisation.
use crate::shared::TcrlmError;
use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

pub const LAYER_NORM_EPS: f32 = 1e-5;

pub enum Parameter<'a> {
    Vector(&'a Array1<f32>),
    Matrix(&'a Array2<f32>),
}

pub enum ParameterMut<'a> {
    Vector(&'a mut Array1<f32>),
    Matrix(&'a mut Array2<f32>),
}

impl Parameter<'_> {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Parameter::Vector(v) => v.shape().to_vec(),
            Parameter::Matrix(m) => m.shape().to_vec(),
        }
    }

    /// Row-major copy of the values
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            Parameter::Vector(v) => v.iter().copied().collect(),
            Parameter::Matrix(m) => m.iter().copied().collect(),
        }
    }
}

impl ParameterMut<'_> {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParameterMut::Vector(v) => v.shape().to_vec(),
            ParameterMut::Matrix(m) => m.shape().to_vec(),
        }
    }

    /// Overwrite with row-major `data` of the given `shape`.
    pub fn assign(&mut self, name: &str, shape: &[usize], data: &[f32]) -> Result<()> {
        let expected = self.shape();
        let numel: usize = expected.iter().product();
        if expected != shape || data.len() != numel {
            return Err(TcrlmError::ShapeMismatch {
                parameter: name.to_string(),
                expected,
                found: shape.to_vec(),
            })?;
        }
        match self {
            ParameterMut::Vector(v) => v.iter_mut().zip(data).for_each(|(a, b)| *a = *b),
            ParameterMut::Matrix(m) => m.iter_mut().zip(data).for_each(|(a, b)| *a = *b),
        }
        Ok(())
    }
}

/// Anything holding learned parameters. Names are dot-separated owner
/// paths, e.g. `_self_attention_stack.layers.0.linear1.weight`.
pub trait Module {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>);
    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    );
}

pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// y = x W^T + b, W stored (out_features, in_features)
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new<R: Rng>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Linear {
        let bound = 1. / (in_features.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Linear {
            weight: Array2::from_shape_simple_fn((out_features, in_features), || dist.sample(&mut *rng)),
            bias: bias.then(|| Array1::from_shape_simple_fn(out_features, || dist.sample(&mut *rng))),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += b;
        }
        y
    }
}

impl Module for Linear {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        out.push((join(prefix, "weight"), Parameter::Matrix(&self.weight)));
        if let Some(b) = &self.bias {
            out.push((join(prefix, "bias"), Parameter::Vector(b)));
        }
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        out.push((join(prefix, "weight"), ParameterMut::Matrix(&mut self.weight)));
        if let Some(b) = &mut self.bias {
            out.push((join(prefix, "bias"), ParameterMut::Vector(b)));
        }
    }
}

/// Lookup table. The padding row is zero and stays zero on load.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    pub weight: Array2<f32>,
    pub padding_idx: Option<usize>,
}

impl Embedding {
    pub fn new<R: Rng>(
        num_embeddings: usize,
        embedding_dim: usize,
        padding_idx: Option<usize>,
        rng: &mut R,
    ) -> Embedding {
        let mut weight = match Normal::new(0f32, 1.) {
            Ok(dist) => Array2::from_shape_simple_fn((num_embeddings, embedding_dim), || {
                dist.sample(&mut *rng)
            }),
            Err(_) => Array2::zeros((num_embeddings, embedding_dim)),
        };
        if let Some(p) = padding_idx {
            weight.row_mut(p).fill(0.);
        }
        Embedding {
            weight,
            padding_idx,
        }
    }

    /// Fixed table, e.g. one-hot or sinusoidal
    pub fn from_table(weight: Array2<f32>) -> Embedding {
        Embedding {
            weight,
            padding_idx: None,
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.nrows()
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&self, indices: &ArrayView1<usize>) -> Result<Array2<f32>> {
        let mut out = Array2::zeros((indices.len(), self.embedding_dim()));
        for (mut row, &idx) in out.axis_iter_mut(Axis(0)).zip(indices.iter()) {
            if idx >= self.num_embeddings() {
                return Err(TcrlmError::OutOfVocabulary {
                    index: idx,
                    size: self.num_embeddings(),
                })?;
            }
            row.assign(&self.weight.row(idx));
        }
        Ok(out)
    }

    pub fn reset_padding_row(&mut self) {
        if let Some(p) = self.padding_idx {
            self.weight.row_mut(p).fill(0.);
        }
    }
}

impl Module for Embedding {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        out.push((join(prefix, "weight"), Parameter::Matrix(&self.weight)));
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        out.push((join(prefix, "weight"), ParameterMut::Matrix(&mut self.weight)));
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
}

impl LayerNorm {
    pub fn new(dim: usize) -> LayerNorm {
        LayerNorm {
            weight: Array1::ones(dim),
            bias: Array1::zeros(dim),
        }
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let denom = (var + LAYER_NORM_EPS).sqrt();
            Zip::from(&mut row)
                .and(&self.weight)
                .and(&self.bias)
                .for_each(|v, &w, &b| *v = (*v - mean) / denom * w + b);
        }
        out
    }
}

impl Module for LayerNorm {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        out.push((join(prefix, "weight"), Parameter::Vector(&self.weight)));
        out.push((join(prefix, "bias"), Parameter::Vector(&self.bias)));
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        out.push((join(prefix, "weight"), ParameterMut::Vector(&mut self.weight)));
        out.push((join(prefix, "bias"), ParameterMut::Vector(&mut self.bias)));
    }
}

/// Row-wise softmax, entries flagged in `masked` get probability 0.
pub fn masked_softmax_rows(scores: &mut Array2<f32>, masked: &[bool]) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row
            .iter()
            .zip(masked)
            .filter(|(_, m)| !**m)
            .map(|(v, _)| *v)
            .fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.;
        for (v, &m) in row.iter_mut().zip(masked) {
            *v = if m || !max.is_finite() {
                0.
            } else {
                (*v - max).exp()
            };
            total += *v;
        }
        if total > 0. {
            row.mapv_inplace(|v| v / total);
        }
    }
}

pub fn relu(x: &mut Array2<f32>) {
    x.mapv_inplace(|v| v.max(0.));
}
