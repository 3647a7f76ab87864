use crate::nn::delegate::VectorRepresentationDelegate;
use crate::nn::layers::{join, Linear, Module, Parameter, ParameterMut};
use crate::nn::self_attention::SelfAttentionStack;
use crate::nn::state_dict::{load_state_dict_into, state_dict_of, StateDict};
use crate::nn::token_embedder::TokenEmbedder;
use crate::nn::Device;
use crate::shared::amino_acids::{NUM_AMINO_ACIDS, NULL};
use crate::tokeniser::TOKEN_ID_FIELD;
use anyhow::Result;
use ndarray::{stack, Array1, Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;

/// Linear map from d_model to one logit per amino acid
#[derive(Clone, Debug, PartialEq)]
pub struct AminoAcidTokenProjector {
    pub projector: Linear,
}

impl AminoAcidTokenProjector {
    pub fn new<R: Rng>(d_model: usize, rng: &mut R) -> AminoAcidTokenProjector {
        AminoAcidTokenProjector {
            projector: Linear::new(d_model, NUM_AMINO_ACIDS, true, rng),
        }
    }

    pub fn forward(&self, token_embeddings: &Array2<f32>) -> Array2<f32> {
        self.projector.forward(&token_embeddings.view())
    }
}

impl Module for AminoAcidTokenProjector {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        self.projector.named_parameters(&join(prefix, "projector"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        self.projector.named_parameters_mut(&join(prefix, "projector"), out);
    }
}

pub fn padding_mask(tokens: &ArrayView2<usize>) -> Vec<bool> {
    tokens.column(TOKEN_ID_FIELD).iter().map(|&t| t == NULL).collect()
}

/// Token embedder -> self-attention stack -> {MLM projector, pooling}
#[derive(Clone, Debug, PartialEq)]
pub struct Bert {
    pub token_embedder: TokenEmbedder,
    pub self_attention_stack: SelfAttentionStack,
    pub mlm_token_prediction_projector: AminoAcidTokenProjector,
    pub vector_representation_delegate: VectorRepresentationDelegate,
}

impl Bert {
    pub fn d_model(&self) -> usize {
        self.self_attention_stack.d_model()
    }

    /// (B, L, fields) -> (B, d_model), unit rows
    pub fn get_vector_representations_of(&self, tokenised: &Array3<usize>, device: Device) -> Result<Array2<f32>> {
        let rows = map_sequences(tokenised, device, |tokens| {
            let padding = padding_mask(&tokens);
            let embedded = self.token_embedder.forward(&tokens)?;
            Ok(self
                .vector_representation_delegate
                .get_vector_representation_of(&self.self_attention_stack, &embedded, &padding))
        })?;
        stack_rows(rows, self.d_model())
    }

    /// (B, L, fields) -> (B, L, 20) logits over the residues
    pub fn get_mlm_token_predictions_for(
        &self,
        tokenised_and_masked: &Array3<usize>,
        device: Device,
    ) -> Result<Array3<f32>> {
        let sequences = map_sequences(tokenised_and_masked, device, |tokens| {
            let padding = padding_mask(&tokens);
            let embedded = self.token_embedder.forward(&tokens)?;
            let contextualised = self.self_attention_stack.forward(&embedded, &padding);
            Ok(self.mlm_token_prediction_projector.forward(&contextualised))
        })?;
        stack_matrices(sequences, tokenised_and_masked.len_of(Axis(1)), NUM_AMINO_ACIDS)
    }

    /// (B, L, fields) -> (B, L, d_model)
    pub fn get_token_embeddings_at_penultimate_layer(
        &self,
        tokenised: &Array3<usize>,
        device: Device,
    ) -> Result<Array3<f32>> {
        let sequences = map_sequences(tokenised, device, |tokens| {
            let padding = padding_mask(&tokens);
            let embedded = self.token_embedder.forward(&tokens)?;
            Ok(self
                .self_attention_stack
                .get_token_embeddings_at_penultimate_layer(&embedded, &padding))
        })?;
        stack_matrices(sequences, tokenised.len_of(Axis(1)), self.d_model())
    }

    pub fn state_dict(&self) -> StateDict {
        state_dict_of(self, "")
    }

    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        load_state_dict_into(self, "", state)?;
        self.token_embedder.reset_padding_rows();
        Ok(())
    }
}

impl Module for Bert {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        self.token_embedder
            .named_parameters(&join(prefix, "_token_embedder"), out);
        self.self_attention_stack
            .named_parameters(&join(prefix, "_self_attention_stack"), out);
        self.mlm_token_prediction_projector
            .named_parameters(&join(prefix, "_mlm_token_prediction_projector"), out);
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        self.token_embedder
            .named_parameters_mut(&join(prefix, "_token_embedder"), out);
        self.self_attention_stack
            .named_parameters_mut(&join(prefix, "_self_attention_stack"), out);
        self.mlm_token_prediction_projector
            .named_parameters_mut(&join(prefix, "_mlm_token_prediction_projector"), out);
    }
}

fn map_sequences<T, F>(batch: &Array3<usize>, device: Device, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(ArrayView2<usize>) -> Result<T> + Sync,
{
    match device {
        Device::Cpu => batch.outer_iter().map(f).collect(),
        Device::Accelerated => (0..batch.len_of(Axis(0)))
            .into_par_iter()
            .map(|i| f(batch.index_axis(Axis(0), i)))
            .collect(),
    }
}

fn stack_rows(rows: Vec<Array1<f32>>, dim: usize) -> Result<Array2<f32>> {
    if rows.is_empty() {
        return Ok(Array2::zeros((0, dim)));
    }
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

fn stack_matrices(matrices: Vec<Array2<f32>>, len: usize, dim: usize) -> Result<Array3<f32>> {
    if matrices.is_empty() {
        return Ok(Array3::zeros((0, len, dim)));
    }
    let views: Vec<_> = matrices.iter().map(|m| m.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Training-time wrapper for the MLM objective
#[derive(Clone, Debug, PartialEq)]
pub struct MlmTrainableModel {
    pub bert: Bert,
}

impl MlmTrainableModel {
    pub fn forward(&self, tokenised_and_masked: &Array3<usize>, device: Device) -> Result<Array3<f32>> {
        self.bert
            .get_mlm_token_predictions_for(tokenised_and_masked, device)
    }
}

/// Training-time wrapper for joint contrastive and MLM objectives
#[derive(Clone, Debug, PartialEq)]
pub struct ClTrainableModel {
    pub bert: Bert,
}

impl ClTrainableModel {
    /// Returns (representations, MLM logits)
    pub fn forward(
        &self,
        tokenised: &Array3<usize>,
        tokenised_and_masked: &Array3<usize>,
        device: Device,
    ) -> Result<(Array2<f32>, Array3<f32>)> {
        let representations = self.bert.get_vector_representations_of(tokenised, device)?;
        let logits = self
            .bert
            .get_mlm_token_predictions_for(tokenised_and_masked, device)?;
        Ok((representations, logits))
    }
}
