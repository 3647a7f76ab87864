//! Padding and noising of tokenised batches.
use crate::shared::amino_acids::{TokenVocabulary, MASK, NULL};
use crate::shared::TcrPmhcPair;
use crate::tokeniser::{NoiseParameters, TokenSequence, Tokeniser, TOKEN_ID_FIELD};
use anyhow::{anyhow, Result};
use ndarray::{s, Array1, Array2, Array3};
use rand::seq::{index, SliceRandom};
use rand::Rng;

/// Share of the non-CLS positions selected for the MLM objective
pub const P_MLM_SELECT: f64 = 0.15;
/// Share of the selected positions replaced by a random residue
pub const P_MLM_RANDOM: f64 = 0.1;
/// Share of the selected positions left untouched
pub const P_MLM_KEEP: f64 = 0.1;
pub const DEFAULT_P_CENSOR: f64 = 0.2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CollationObjective {
    Default,
    Mlm,
    Cl { supervised: bool, p_censor: f64 },
    NoOp,
}

#[derive(Clone, Debug)]
pub enum CollatedBatch {
    Default(Array3<usize>),
    Mlm {
        masked: Array3<usize>,
        target: Array2<usize>,
    },
    Cl {
        double_view: Array3<usize>,
        double_view_positives_mask: Array2<bool>,
        masked: Array3<usize>,
        target: Array2<usize>,
    },
    NoOp(Vec<TcrPmhcPair>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchCollator {
    pub tokeniser: Tokeniser,
    pub objective: CollationObjective,
}

impl BatchCollator {
    pub fn new(tokeniser: Tokeniser, objective: CollationObjective) -> BatchCollator {
        BatchCollator {
            tokeniser,
            objective,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.objective {
            CollationObjective::Default => "DefaultBatchCollator",
            CollationObjective::Mlm => "MlmBatchCollator",
            CollationObjective::Cl { .. } => "ClBatchCollator",
            CollationObjective::NoOp => "NoOpCollator",
        }
    }

    /// Collate a batch of consecutive table rows starting at `first_row`.
    /// Output row i always corresponds to `pairs[i]`.
    pub fn collate<R: Rng>(
        &self,
        pairs: &[TcrPmhcPair],
        first_row: usize,
        rng: &mut R,
    ) -> Result<CollatedBatch> {
        let rows: Vec<usize> = (first_row..first_row + pairs.len()).collect();
        self.collate_rows(pairs, &rows, rng)
    }

    /// `rows[i]` is the table index of `pairs[i]`, used when reporting a
    /// bad record.
    pub fn collate_rows<R: Rng>(
        &self,
        pairs: &[TcrPmhcPair],
        rows: &[usize],
        rng: &mut R,
    ) -> Result<CollatedBatch> {
        if rows.len() != pairs.len() {
            return Err(anyhow!(
                "{} row indices given for a batch of {}",
                rows.len(),
                pairs.len()
            ));
        }
        let num_fields = self.tokeniser.num_fields();
        match self.objective {
            CollationObjective::NoOp => Ok(CollatedBatch::NoOp(pairs.to_vec())),
            CollationObjective::Default => {
                let tokenised = self.tokenise_all(pairs, rows)?;
                Ok(CollatedBatch::Default(pad_tokenised_sequences(
                    &tokenised, num_fields,
                )))
            }
            CollationObjective::Mlm => {
                let tokenised = self.tokenise_all(pairs, rows)?;
                let (masked, target) = self.mask_all(&tokenised, rng);
                Ok(CollatedBatch::Mlm { masked, target })
            }
            CollationObjective::Cl {
                supervised,
                p_censor,
            } => {
                let tokenised = self.tokenise_all(pairs, rows)?;
                let (masked, target) = self.mask_all(&tokenised, rng);

                let noise = NoiseParameters {
                    p_drop_aa: p_censor,
                    ..self.tokeniser.noise
                };
                let mut views = Vec::with_capacity(2 * pairs.len());
                for _ in 0..2 {
                    for (i, pair) in pairs.iter().enumerate() {
                        views.push(self.tokeniser.tokenise_with_noise(
                            &pair.tcr,
                            rows[i],
                            &noise,
                            rng,
                        )?);
                    }
                }

                Ok(CollatedBatch::Cl {
                    double_view: pad_tokenised_sequences(&views, num_fields),
                    double_view_positives_mask: positives_mask(pairs, supervised),
                    masked,
                    target,
                })
            }
        }
    }

    fn tokenise_all(&self, pairs: &[TcrPmhcPair], rows: &[usize]) -> Result<Vec<TokenSequence>> {
        pairs
            .iter()
            .zip(rows)
            .map(|(pair, &row)| self.tokeniser.tokenise(&pair.tcr, row))
            .collect()
    }

    fn mask_all<R: Rng>(&self, tokenised: &[TokenSequence], rng: &mut R) -> (Array3<usize>, Array2<usize>) {
        let vocabulary = self.tokeniser.token_vocabulary();
        let (masked, targets): (Vec<_>, Vec<_>) = tokenised
            .iter()
            .map(|seq| mask_tokens(seq, vocabulary, &mut *rng))
            .unzip();
        (
            pad_tokenised_sequences(&masked, self.tokeniser.num_fields()),
            pad_targets(&targets),
        )
    }
}

/// Right-pad to the longest sequence with the all-NULL vector.
pub fn pad_tokenised_sequences(sequences: &[TokenSequence], num_fields: usize) -> Array3<usize> {
    let max_len = sequences.iter().map(|s| s.nrows()).max().unwrap_or(0);
    let mut batch = Array3::from_elem((sequences.len(), max_len, num_fields), NULL);
    for (i, seq) in sequences.iter().enumerate() {
        batch.slice_mut(s![i, ..seq.nrows(), ..]).assign(seq);
    }
    batch
}

fn pad_targets(targets: &[Array1<usize>]) -> Array2<usize> {
    let max_len = targets.iter().map(|t| t.len()).max().unwrap_or(0);
    let mut batch = Array2::from_elem((targets.len(), max_len), NULL);
    for (i, t) in targets.iter().enumerate() {
        batch.slice_mut(s![i, ..t.len()]).assign(t);
    }
    batch
}

/// Pick `ceil(0.15 * (len - 1))` residue positions without replacement and
/// corrupt them. One uniform draw `r` per picked position decides: `r < 0.1`
/// gives a random residue different from the original, `1 - r < 0.1` leaves
/// the token as is, anything else becomes MASK. The target holds the
/// original token at picked positions and NULL elsewhere.
pub fn mask_tokens<R: Rng>(
    sequence: &TokenSequence,
    vocabulary: TokenVocabulary,
    rng: &mut R,
) -> (TokenSequence, Array1<usize>) {
    let len = sequence.nrows();
    let mut masked = sequence.clone();
    let mut target = Array1::from_elem(len, NULL);
    if len < 2 {
        return (masked, target);
    }

    let num_to_mask = (P_MLM_SELECT * (len - 1) as f64).ceil() as usize;
    let residues = vocabulary.non_special_tokens();

    for offset in index::sample(rng, len - 1, num_to_mask) {
        let position = offset + 1;
        let original = sequence[[position, TOKEN_ID_FIELD]];
        target[position] = original;

        let r: f64 = rng.gen();
        if r < P_MLM_RANDOM {
            let candidates: Vec<usize> = residues.iter().copied().filter(|&t| t != original).collect();
            if let Some(&replacement) = candidates.choose(rng) {
                masked[[position, TOKEN_ID_FIELD]] = replacement;
            }
        } else if 1. - r < P_MLM_KEEP {
            continue;
        } else {
            masked[[position, TOKEN_ID_FIELD]] = MASK;
        }
    }
    (masked, target)
}

/// (2B, 2B) mask over a double-view batch. Views of the same TCR are
/// positive, as are TCRs sharing a pMHC in supervised mode. The diagonal
/// is never positive.
pub fn positives_mask(pairs: &[TcrPmhcPair], supervised: bool) -> Array2<bool> {
    let b = pairs.len();
    Array2::from_shape_fn((2 * b, 2 * b), |(i, j)| {
        if i == j {
            return false;
        }
        let (ii, jj) = (i % b, j % b);
        ii == jj || (supervised && pairs[ii].pmhc == pairs[jj].pmhc)
    })
}
