//! Domain primitives shared by tokenisers, models and the public API
pub mod amino_acids;
pub mod errors;
pub mod gene;
pub mod table;
pub mod tcr;
pub mod utils;

pub use amino_acids::{AminoAcid, CompartmentScheme, TokenVocabulary, CLS, MASK, NULL};
pub use errors::TcrlmError;
pub use gene::{parse_gene_symbol, Chain, GeneOracle, GeneSymbol, ReferenceGeneTable};
pub use table::{TcrRow, TcrTable};
pub use tcr::{
    make_pmhc_from_components, make_tcr_from_components, MhcGene, Pmhc, Tcr, TcrPmhcPair, Tcrv,
};
pub use utils::{cdist_from_representations, pdist_from_representations, rng_for};
