//! Post-norm transformer encoder with key-padding masks.
use crate::nn::layers::{join, masked_softmax_rows, relu, LayerNorm, Linear, Module, Parameter, ParameterMut};
use crate::shared::TcrlmError;
use anyhow::Result;
use ndarray::{s, Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

pub const DEFAULT_DROPOUT: f64 = 0.1;
pub const FEEDFORWARD_EXPANSION: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct MultiheadAttention {
    pub in_proj_weight: Array2<f32>,
    pub in_proj_bias: Array1<f32>,
    pub out_proj: Linear,
    pub num_heads: usize,
}

impl MultiheadAttention {
    pub fn new<R: Rng>(d_model: usize, num_heads: usize, rng: &mut R) -> MultiheadAttention {
        // xavier uniform on the packed q/k/v projection
        let bound = (6. / (4 * d_model) as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let mut out_proj = Linear::new(d_model, d_model, true, rng);
        if let Some(b) = &mut out_proj.bias {
            b.fill(0.);
        }
        MultiheadAttention {
            in_proj_weight: Array2::from_shape_simple_fn((3 * d_model, d_model), || {
                dist.sample(&mut *rng)
            }),
            in_proj_bias: Array1::zeros(3 * d_model),
            out_proj,
            num_heads,
        }
    }

    fn d_model(&self) -> usize {
        self.in_proj_weight.ncols()
    }

    /// `key_padding[j]` excludes key j from every query's attention.
    pub fn forward(&self, x: &ArrayView2<f32>, key_padding: &[bool]) -> Array2<f32> {
        let d = self.d_model();
        let head_dim = d / self.num_heads;
        let scale = 1. / (head_dim as f32).sqrt();

        let mut qkv = x.dot(&self.in_proj_weight.t());
        qkv += &self.in_proj_bias;

        let mut context = Array2::zeros((x.nrows(), d));
        for h in 0..self.num_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let q = qkv.slice(s![.., cols.clone()]);
            let k = qkv.slice(s![.., d + cols.start..d + cols.end]);
            let v = qkv.slice(s![.., 2 * d + cols.start..2 * d + cols.end]);

            let mut scores = q.dot(&k.t()) * scale;
            masked_softmax_rows(&mut scores, key_padding);
            context.slice_mut(s![.., cols]).assign(&scores.dot(&v));
        }
        self.out_proj.forward(&context.view())
    }
}

impl Module for MultiheadAttention {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        out.push((join(prefix, "in_proj_weight"), Parameter::Matrix(&self.in_proj_weight)));
        out.push((join(prefix, "in_proj_bias"), Parameter::Vector(&self.in_proj_bias)));
        self.out_proj.named_parameters(&join(prefix, "out_proj"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        out.push((
            join(prefix, "in_proj_weight"),
            ParameterMut::Matrix(&mut self.in_proj_weight),
        ));
        out.push((
            join(prefix, "in_proj_bias"),
            ParameterMut::Vector(&mut self.in_proj_bias),
        ));
        self.out_proj.named_parameters_mut(&join(prefix, "out_proj"), out);
    }
}

/// attention -> add & norm -> ReLU feed-forward -> add & norm
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderLayer {
    pub self_attn: MultiheadAttention,
    pub linear1: Linear,
    pub linear2: Linear,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
}

impl EncoderLayer {
    pub fn new<R: Rng>(d_model: usize, nhead: usize, rng: &mut R) -> EncoderLayer {
        let dim_feedforward = FEEDFORWARD_EXPANSION * d_model;
        EncoderLayer {
            self_attn: MultiheadAttention::new(d_model, nhead, rng),
            linear1: Linear::new(d_model, dim_feedforward, true, rng),
            linear2: Linear::new(dim_feedforward, d_model, true, rng),
            norm1: LayerNorm::new(d_model),
            norm2: LayerNorm::new(d_model),
        }
    }

    pub fn forward(&self, x: &Array2<f32>, padding: &[bool]) -> Array2<f32> {
        let attended = self.self_attn.forward(&x.view(), padding);
        let x = self.norm1.forward(&(x + &attended));

        let mut hidden = self.linear1.forward(&x.view());
        relu(&mut hidden);
        let fed = self.linear2.forward(&hidden.view());
        self.norm2.forward(&(&x + &fed))
    }
}

impl Module for EncoderLayer {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        self.self_attn.named_parameters(&join(prefix, "self_attn"), out);
        self.linear1.named_parameters(&join(prefix, "linear1"), out);
        self.linear2.named_parameters(&join(prefix, "linear2"), out);
        self.norm1.named_parameters(&join(prefix, "norm1"), out);
        self.norm2.named_parameters(&join(prefix, "norm2"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        self.self_attn.named_parameters_mut(&join(prefix, "self_attn"), out);
        self.linear1.named_parameters_mut(&join(prefix, "linear1"), out);
        self.linear2.named_parameters_mut(&join(prefix, "linear2"), out);
        self.norm1.named_parameters_mut(&join(prefix, "norm1"), out);
        self.norm2.named_parameters_mut(&join(prefix, "norm2"), out);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransformerEncoder {
    pub layers: Vec<EncoderLayer>,
    pub d_model: usize,
    pub nhead: usize,
    pub dropout: f64,
}

impl TransformerEncoder {
    pub fn new<R: Rng>(
        num_layers: usize,
        d_model: usize,
        nhead: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Result<TransformerEncoder> {
        if num_layers == 0 {
            return Err(TcrlmError::configuration("num_layers must be at least 1"))?;
        }
        if nhead == 0 || d_model % nhead != 0 {
            return Err(TcrlmError::configuration(format!(
                "d_model ({}) must be divisible by nhead ({})",
                d_model, nhead
            )))?;
        }
        Ok(TransformerEncoder {
            layers: (0..num_layers)
                .map(|_| EncoderLayer::new(d_model, nhead, &mut *rng))
                .collect(),
            d_model,
            nhead,
            dropout,
        })
    }

    /// Run the first `depth` layers.
    pub fn forward_to_depth(&self, x: &Array2<f32>, padding: &[bool], depth: usize) -> Array2<f32> {
        self.layers
            .iter()
            .take(depth)
            .fold(x.clone(), |acc, layer| layer.forward(&acc, padding))
    }
}

impl Module for TransformerEncoder {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.named_parameters(&join(prefix, &format!("layers.{}", i)), out);
        }
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.named_parameters_mut(&join(prefix, &format!("layers.{}", i)), out);
        }
    }
}

/// Contextualises token embeddings. Exposes the full stack and the stack
/// minus its last layer.
#[derive(Clone, Debug, PartialEq)]
pub enum SelfAttentionStack {
    WithBuiltins(TransformerEncoder),
    WithInitialProjection {
        initial_projector: Linear,
        standard_stack: TransformerEncoder,
    },
}

impl SelfAttentionStack {
    pub fn with_builtins<R: Rng>(
        num_layers: usize,
        d_model: usize,
        nhead: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Result<SelfAttentionStack> {
        Ok(SelfAttentionStack::WithBuiltins(TransformerEncoder::new(
            num_layers, d_model, nhead, dropout, rng,
        )?))
    }

    /// Bias-free projection from `embedding_dim` to `d_model` ahead of the
    /// stack.
    pub fn with_initial_projection<R: Rng>(
        num_layers: usize,
        embedding_dim: usize,
        d_model: usize,
        nhead: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Result<SelfAttentionStack> {
        let initial_projector = Linear::new(embedding_dim, d_model, false, rng);
        let standard_stack = TransformerEncoder::new(num_layers, d_model, nhead, dropout, rng)?;
        Ok(SelfAttentionStack::WithInitialProjection {
            initial_projector,
            standard_stack,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SelfAttentionStack::WithBuiltins(_) => "SelfAttentionStackWithBuiltins",
            SelfAttentionStack::WithInitialProjection { .. } => {
                "SelfAttentionStackWithInitialProjection"
            }
        }
    }

    fn encoder(&self) -> &TransformerEncoder {
        match self {
            SelfAttentionStack::WithBuiltins(encoder) => encoder,
            SelfAttentionStack::WithInitialProjection { standard_stack, .. } => standard_stack,
        }
    }

    pub fn d_model(&self) -> usize {
        self.encoder().d_model
    }

    pub fn num_layers(&self) -> usize {
        self.encoder().layers.len()
    }

    /// Width of the token embeddings the stack accepts
    pub fn input_dim(&self) -> usize {
        match self {
            SelfAttentionStack::WithBuiltins(encoder) => encoder.d_model,
            SelfAttentionStack::WithInitialProjection {
                initial_projector, ..
            } => initial_projector.in_features(),
        }
    }

    fn project(&self, token_embeddings: &Array2<f32>) -> Array2<f32> {
        match self {
            SelfAttentionStack::WithBuiltins(_) => token_embeddings.clone(),
            SelfAttentionStack::WithInitialProjection {
                initial_projector, ..
            } => initial_projector.forward(&token_embeddings.view()),
        }
    }

    /// (L, input_dim) -> (L, d_model), one sequence at a time.
    pub fn forward(&self, token_embeddings: &Array2<f32>, padding: &[bool]) -> Array2<f32> {
        let x = self.project(token_embeddings);
        self.encoder().forward_to_depth(&x, padding, self.num_layers())
    }

    pub fn get_token_embeddings_at_penultimate_layer(
        &self,
        token_embeddings: &Array2<f32>,
        padding: &[bool],
    ) -> Array2<f32> {
        let x = self.project(token_embeddings);
        self.encoder()
            .forward_to_depth(&x, padding, self.num_layers() - 1)
    }
}

impl Module for SelfAttentionStack {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        match self {
            SelfAttentionStack::WithBuiltins(encoder) => {
                encoder.named_parameters(&join(prefix, "_self_attention_stack"), out)
            }
            SelfAttentionStack::WithInitialProjection {
                initial_projector,
                standard_stack,
            } => {
                initial_projector.named_parameters(&join(prefix, "_initial_projector"), out);
                standard_stack.named_parameters(
                    &join(prefix, "_standard_stack._self_attention_stack"),
                    out,
                );
            }
        }
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        match self {
            SelfAttentionStack::WithBuiltins(encoder) => {
                encoder.named_parameters_mut(&join(prefix, "_self_attention_stack"), out)
            }
            SelfAttentionStack::WithInitialProjection {
                initial_projector,
                standard_stack,
            } => {
                initial_projector.named_parameters_mut(&join(prefix, "_initial_projector"), out);
                standard_stack.named_parameters_mut(
                    &join(prefix, "_standard_stack._self_attention_stack"),
                    out,
                );
            }
        }
    }
}
