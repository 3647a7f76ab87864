use crate::nn::self_attention::SelfAttentionStack;
use ndarray::{Array1, Array2, Axis};

const EPSILON: f32 = 1e-12;

/// Pooling strategy turning contextualised tokens into one unit vector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorRepresentationDelegate {
    /// CLS token after the full stack
    Cls,
    /// mean over the residue tokens (no CLS, no padding) after the
    /// penultimate layer
    AveragePool,
}

impl VectorRepresentationDelegate {
    pub fn name(&self) -> &'static str {
        match self {
            VectorRepresentationDelegate::Cls => "ClsVectorRepresentationDelegate",
            VectorRepresentationDelegate::AveragePool => "AveragePoolVectorRepresentationDelegate",
        }
    }

    pub fn get_vector_representation_of(
        &self,
        stack: &SelfAttentionStack,
        token_embeddings: &Array2<f32>,
        padding: &[bool],
    ) -> Array1<f32> {
        let pooled = match self {
            VectorRepresentationDelegate::Cls => {
                stack.forward(token_embeddings, padding).row(0).to_owned()
            }
            VectorRepresentationDelegate::AveragePool => {
                let contextualised =
                    stack.get_token_embeddings_at_penultimate_layer(token_embeddings, padding);
                let mut total = Array1::zeros(contextualised.ncols());
                let mut count = 0;
                for (j, row) in contextualised.axis_iter(Axis(0)).enumerate().skip(1) {
                    if !padding[j] {
                        total += &row;
                        count += 1;
                    }
                }
                total / (count.max(1) as f32)
            }
        };
        l2_normalize(pooled)
    }
}

fn l2_normalize(v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt().max(EPSILON);
    v / norm
}
