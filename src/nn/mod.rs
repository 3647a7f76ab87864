//! Encoder components: token embedders, self-attention stacks, pooling
//! delegates and the composed `Bert`.
pub mod bert;
pub mod delegate;
pub mod layers;
pub mod self_attention;
pub mod state_dict;
pub mod token_embedder;

pub use bert::{AminoAcidTokenProjector, Bert, ClTrainableModel, MlmTrainableModel};
pub use delegate::VectorRepresentationDelegate;
pub use self_attention::SelfAttentionStack;
pub use state_dict::{StateDict, TensorRecord};
pub use token_embedder::TokenEmbedder;

use serde::{Deserialize, Serialize};

/// Where forward passes run. `Accelerated` spreads the sequences of a
/// batch over the rayon pool, results are identical to `Cpu`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Accelerated,
}
