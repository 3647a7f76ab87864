//! Learned representations of T-cell receptors.
//!
//! Tabular TCR records are turned into token vectors (`tokeniser`), padded
//! and optionally noised (`collator`), and embedded by a configurable BERT
//! encoder (`nn`, assembled by `config`). `model` exposes embeddings,
//! distance matrices and residue-level representations.
#![warn(clippy::large_types_passed_by_value)]

pub mod collator;
pub mod config;
pub mod dataloader;
pub mod model;
pub mod nn;
pub mod shared;
pub mod tokeniser;

pub use crate::collator::{BatchCollator, CollatedBatch, CollationObjective};
pub use crate::config::{Config, ConfigReader};
pub use crate::dataloader::{
    DoubleDatasetDataLoader, Sampler, SingleDatasetDataLoader, TcrDataLoader, TcrDataset,
};
pub use crate::model::{
    calc_cdist_matrix, calc_pdist_vector, calc_residue_representations,
    calc_vector_representations, DefaultModel, ResidueRepresentations, Sceptr,
};
pub use crate::nn::{Bert, Device};
pub use crate::shared::{
    cdist_from_representations, make_pmhc_from_components, make_tcr_from_components,
    pdist_from_representations, AminoAcid, GeneOracle, Pmhc, ReferenceGeneTable, Tcr,
    TcrPmhcPair, TcrRow, TcrTable, TcrlmError, Tcrv,
};
pub use crate::tokeniser::{NoiseParameters, Tokeniser};
