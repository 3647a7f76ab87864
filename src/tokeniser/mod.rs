//! Conversion of a `Tcr` into a sequence of integer token vectors.
//!
//! A token vector is `(token_id, position, compartment_length, compartment_id)`,
//! the last field being absent for tokenisers without a compartment scheme.
//! Every sequence starts with a CLS vector `(CLS, 0, 0, 0)` and continues
//! with one vector per residue, compartments in canonical order
//! (CDR1 -> CDR2 -> CDR3, alpha before beta). Positions are 1-indexed.
//!
//! The tokeniser variants are the combinations of a `ChainCoverage` and a
//! `LoopCoverage`, see `Tokeniser::from_name` for the registered ones.
use crate::shared::amino_acids::{CompartmentScheme, TokenVocabulary, CLS, NULL};
use crate::shared::{AminoAcid, Chain, Tcr, TcrlmError};
use anyhow::Result;
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub type TokenSequence = Array2<usize>;

pub const TOKEN_ID_FIELD: usize = 0;
pub const POSITION_FIELD: usize = 1;
pub const COMPARTMENT_LENGTH_FIELD: usize = 2;
pub const COMPARTMENT_ID_FIELD: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainCoverage {
    Alpha,
    Beta,
    Paired,
}

impl ChainCoverage {
    pub fn chains(&self) -> Vec<Chain> {
        match self {
            ChainCoverage::Alpha => vec![Chain::Alpha],
            ChainCoverage::Beta => vec![Chain::Beta],
            ChainCoverage::Paired => vec![Chain::Alpha, Chain::Beta],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopCoverage {
    Cdr3,
    AllCdrs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CdrLoop {
    Cdr1,
    Cdr2,
    Cdr3,
}

impl LoopCoverage {
    pub fn loops(&self) -> Vec<CdrLoop> {
        match self {
            LoopCoverage::Cdr3 => vec![CdrLoop::Cdr3],
            LoopCoverage::AllCdrs => vec![CdrLoop::Cdr1, CdrLoop::Cdr2, CdrLoop::Cdr3],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Compartment {
    pub chain: Chain,
    pub cdr: CdrLoop,
}

impl Compartment {
    fn sequence<'a>(&self, tcr: &'a Tcr) -> Option<&'a AminoAcid> {
        match (self.chain, self.cdr) {
            (Chain::Alpha, CdrLoop::Cdr1) => tcr.cdr1a_sequence(),
            (Chain::Alpha, CdrLoop::Cdr2) => tcr.cdr2a_sequence(),
            (Chain::Alpha, CdrLoop::Cdr3) => tcr.junction_a_sequence.as_ref(),
            (Chain::Beta, CdrLoop::Cdr1) => tcr.cdr1b_sequence(),
            (Chain::Beta, CdrLoop::Cdr2) => tcr.cdr2b_sequence(),
            (Chain::Beta, CdrLoop::Cdr3) => tcr.junction_b_sequence.as_ref(),
        }
    }

    /// Value of the compartment field under `scheme` (never 0)
    pub fn index(&self, scheme: CompartmentScheme) -> usize {
        let loop_offset = match self.cdr {
            CdrLoop::Cdr1 => 1,
            CdrLoop::Cdr2 => 2,
            CdrLoop::Cdr3 => 3,
        };
        match (scheme, self.chain) {
            (CompartmentScheme::Cdr, Chain::Alpha) => loop_offset,
            (CompartmentScheme::Cdr, Chain::Beta) => 3 + loop_offset,
            (CompartmentScheme::SingleChainCdr, _) => loop_offset,
            (CompartmentScheme::Cdr3, Chain::Alpha) => 1,
            (CompartmentScheme::Cdr3, Chain::Beta) => 2,
            (CompartmentScheme::Absent, _) => NULL,
        }
    }
}

/// Probabilities used when generating a noised view of a TCR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoiseParameters {
    /// per residue
    #[serde(default)]
    pub p_drop_aa: f64,
    /// per CDR loop
    #[serde(default)]
    pub p_drop_cdr: f64,
    /// per TCR, only when both chains are present
    #[serde(default)]
    pub p_drop_chain: f64,
}

impl NoiseParameters {
    pub fn residues_only(p_drop_aa: f64) -> NoiseParameters {
        NoiseParameters {
            p_drop_aa,
            ..Default::default()
        }
    }

    pub fn is_noiseless(&self) -> bool {
        self.p_drop_aa <= 0. && self.p_drop_cdr <= 0. && self.p_drop_chain <= 0.
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tokeniser {
    pub chains: ChainCoverage,
    pub loops: LoopCoverage,
    pub noise: NoiseParameters,
}

impl Tokeniser {
    pub fn new(chains: ChainCoverage, loops: LoopCoverage) -> Tokeniser {
        Tokeniser {
            chains,
            loops,
            noise: NoiseParameters::default(),
        }
    }

    pub fn with_noise(mut self, noise: NoiseParameters) -> Tokeniser {
        self.noise = noise;
        self
    }

    /// Registered tokeniser names and the axes they stand for
    pub fn from_name(name: &str) -> Option<Tokeniser> {
        let (chains, loops) = match name {
            "CdrTokeniser" => (ChainCoverage::Paired, LoopCoverage::AllCdrs),
            "AlphaCdrTokeniser" => (ChainCoverage::Alpha, LoopCoverage::AllCdrs),
            "BetaCdrTokeniser" => (ChainCoverage::Beta, LoopCoverage::AllCdrs),
            "Cdr3Tokeniser" => (ChainCoverage::Paired, LoopCoverage::Cdr3),
            "BetaCdr3Tokeniser" => (ChainCoverage::Beta, LoopCoverage::Cdr3),
            _ => return None,
        };
        Some(Tokeniser::new(chains, loops))
    }

    pub fn name(&self) -> &'static str {
        match (self.chains, self.loops) {
            (ChainCoverage::Paired, LoopCoverage::AllCdrs) => "CdrTokeniser",
            (ChainCoverage::Alpha, LoopCoverage::AllCdrs) => "AlphaCdrTokeniser",
            (ChainCoverage::Beta, LoopCoverage::AllCdrs) => "BetaCdrTokeniser",
            (ChainCoverage::Paired, LoopCoverage::Cdr3) => "Cdr3Tokeniser",
            (ChainCoverage::Beta, LoopCoverage::Cdr3) => "BetaCdr3Tokeniser",
            (ChainCoverage::Alpha, LoopCoverage::Cdr3) => "AlphaCdr3Tokeniser",
        }
    }

    pub fn token_vocabulary(&self) -> TokenVocabulary {
        TokenVocabulary::AminoAcid
    }

    pub fn compartment_scheme(&self) -> CompartmentScheme {
        match (self.chains, self.loops) {
            (ChainCoverage::Paired, LoopCoverage::AllCdrs) => CompartmentScheme::Cdr,
            (_, LoopCoverage::AllCdrs) => CompartmentScheme::SingleChainCdr,
            (ChainCoverage::Paired, LoopCoverage::Cdr3) => CompartmentScheme::Cdr3,
            (_, LoopCoverage::Cdr3) => CompartmentScheme::Absent,
        }
    }

    /// Arity of a token vector
    pub fn num_fields(&self) -> usize {
        match self.compartment_scheme() {
            CompartmentScheme::Absent => 3,
            _ => 4,
        }
    }

    /// Included compartments in canonical order
    pub fn compartments(&self) -> Vec<Compartment> {
        let mut out = vec![];
        for chain in self.chains.chains() {
            for cdr in self.loops.loops() {
                out.push(Compartment { chain, cdr });
            }
        }
        out
    }

    /// `row` is only used to report the offending record.
    pub fn tokenise(&self, tcr: &Tcr, row: usize) -> Result<TokenSequence> {
        let mut vectors = vec![self.cls_vector()];
        for compartment in self.compartments() {
            if let Some(seq) = compartment.sequence(tcr) {
                let tokens = seq.token_indices();
                let kept: Vec<usize> = (0..tokens.len()).collect();
                vectors.extend(self.compartment_vectors(compartment, &tokens, &kept));
            }
        }

        if vectors.len() == 1 {
            return Err(TcrlmError::MissingInput {
                row,
                reason: format!(
                    "tcr {} does not contain any information usable by {}",
                    tcr,
                    self.name()
                ),
            })?;
        }
        self.to_array(vectors)
    }

    /// Tokenise with the tokeniser's own noise parameters.
    pub fn tokenise_noised<R: Rng>(&self, tcr: &Tcr, row: usize, rng: &mut R) -> Result<TokenSequence> {
        self.tokenise_with_noise(tcr, row, &self.noise, rng)
    }

    /// Noised view of `tcr`: whole chains, whole loops and single residues
    /// are independently dropped. A compartment is never emptied by residue
    /// dropout, and a view left with no informative token falls back to
    /// the noiseless tokenisation.
    pub fn tokenise_with_noise<R: Rng>(
        &self,
        tcr: &Tcr,
        row: usize,
        noise: &NoiseParameters,
        rng: &mut R,
    ) -> Result<TokenSequence> {
        let present: Vec<(Compartment, Vec<usize>)> = self
            .compartments()
            .into_iter()
            .filter_map(|c| c.sequence(tcr).map(|s| (c, s.token_indices())))
            .filter(|(_, tokens)| !tokens.is_empty())
            .collect();

        let mut kept_compartments = present.clone();

        if self.chains == ChainCoverage::Paired && noise.p_drop_chain > 0. {
            let has_alpha = present.iter().any(|(c, _)| c.chain == Chain::Alpha);
            let has_beta = present.iter().any(|(c, _)| c.chain == Chain::Beta);
            if has_alpha && has_beta && rng.gen::<f64>() < noise.p_drop_chain {
                let dropped = if rng.gen::<bool>() {
                    Chain::Alpha
                } else {
                    Chain::Beta
                };
                kept_compartments.retain(|(c, _)| c.chain != dropped);
            }
        }

        if noise.p_drop_cdr > 0. {
            let before = kept_compartments.clone();
            kept_compartments.retain(|_| rng.gen::<f64>() >= noise.p_drop_cdr);
            if kept_compartments.is_empty() {
                kept_compartments = before;
            }
        }

        let mut vectors = vec![self.cls_vector()];
        for (compartment, tokens) in &kept_compartments {
            let mut kept: Vec<usize> = (0..tokens.len())
                .filter(|_| noise.p_drop_aa <= 0. || rng.gen::<f64>() >= noise.p_drop_aa)
                .collect();
            if kept.is_empty() {
                kept = (0..tokens.len()).collect();
            }
            vectors.extend(self.compartment_vectors(*compartment, tokens, &kept));
        }

        if vectors.len() == 1 {
            return self.tokenise(tcr, row);
        }
        self.to_array(vectors)
    }

    fn cls_vector(&self) -> Vec<usize> {
        let mut v = vec![NULL; self.num_fields()];
        v[TOKEN_ID_FIELD] = CLS;
        v
    }

    /// Vectors for the residues of `tokens` listed in `kept`. Positions and
    /// lengths always refer to the full loop.
    fn compartment_vectors(
        &self,
        compartment: Compartment,
        tokens: &[usize],
        kept: &[usize],
    ) -> Vec<Vec<usize>> {
        let scheme = self.compartment_scheme();
        kept.iter()
            .map(|&i| {
                let mut v = vec![tokens[i], i + 1, tokens.len()];
                if scheme != CompartmentScheme::Absent {
                    v.push(compartment.index(scheme));
                }
                v
            })
            .collect()
    }

    fn to_array(&self, vectors: Vec<Vec<usize>>) -> Result<TokenSequence> {
        let n = vectors.len();
        let flat: Vec<usize> = vectors.into_iter().flatten().collect();
        Ok(Array2::from_shape_vec((n, self.num_fields()), flat)?)
    }
}
