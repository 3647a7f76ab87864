//! Token embedders, composed from a token-identity, a position and a
//! compartment component.
use crate::nn::layers::{join, Embedding, Module, Parameter, ParameterMut};
use crate::shared::amino_acids::{
    blosum62, CompartmentScheme, TokenVocabulary, AMINO_ACIDS, NUM_AMINO_ACIDS, NUM_SPECIAL_TOKENS,
    NULL,
};
use crate::shared::TcrlmError;
use crate::tokeniser::{
    Tokeniser, COMPARTMENT_ID_FIELD, COMPARTMENT_LENGTH_FIELD, POSITION_FIELD, TOKEN_ID_FIELD,
};
use anyhow::Result;
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

pub const MAX_PLAUSIBLE_CDR_LENGTH: usize = 100;
pub const DEFAULT_SIN_SCALE_FACTOR: f32 = 30.;
/// Relative position of the only residue of a length-1 compartment
pub const RELATIVE_POSITION_OF_SINGLETON: f32 = 0.5;

/// Identity matrix under a zero row: index 0 (NULL) embeds to zeros.
pub fn one_hot_table(num_tokens_including_null: usize) -> Array2<f32> {
    let dim = num_tokens_including_null.saturating_sub(1);
    let mut table = Array2::zeros((num_tokens_including_null, dim));
    for i in 0..dim {
        table[[i + 1, i]] = 1.;
    }
    table
}

/// Row p >= 1 holds sin/cos of (p - 1) / scale^(2i / dim) on even/odd
/// channels. Row 0 is zero.
pub fn sin_position_table(num_positions: usize, dim: usize, scale: f32) -> Result<Array2<f32>> {
    if dim % 2 != 0 {
        return Err(TcrlmError::configuration("embedding_dim must be even"))?;
    }
    let mut table = Array2::zeros((num_positions + 1, dim));
    for p in 1..=num_positions {
        for i in (0..dim).step_by(2) {
            let angle = (p - 1) as f32 / scale.powf(i as f32 / dim as f32);
            table[[p, i]] = angle.sin();
            table[[p, i + 1]] = angle.cos();
        }
    }
    Ok(table)
}

/// BLOSUM62 rows scaled by the largest absolute score, zero rows for the
/// special tokens. Shape (vocabulary, 20).
pub fn blosum_table() -> Array2<f32> {
    let mut table = Array2::zeros((NUM_SPECIAL_TOKENS + NUM_AMINO_ACIDS, NUM_AMINO_ACIDS));
    for (i, &a) in AMINO_ACIDS.iter().enumerate() {
        for (j, &b) in AMINO_ACIDS.iter().enumerate() {
            table[[NUM_SPECIAL_TOKENS + i, j]] = blosum62(a, b).unwrap_or(0) as f32;
        }
    }
    let max_abs = table.iter().fold(0f32, |m, v| m.max(v.abs()));
    if max_abs > 0. {
        table /= max_abs;
    }
    table
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenComponent {
    OneHot(Embedding),
    /// fixed substitution profile plus a learned embedding of the special
    /// tokens
    Blosum {
        blosum: Embedding,
        special_token_embeddings: Embedding,
    },
    Learned(Embedding),
}

impl TokenComponent {
    fn dim(&self) -> usize {
        match self {
            TokenComponent::OneHot(table) => table.embedding_dim(),
            TokenComponent::Blosum { blosum, .. } => blosum.embedding_dim(),
            TokenComponent::Learned(embedding) => embedding.embedding_dim(),
        }
    }

    fn forward(&self, tokens: &ArrayView1<usize>) -> Result<Array2<f32>> {
        match self {
            TokenComponent::OneHot(table) => table.forward(tokens),
            TokenComponent::Learned(embedding) => embedding.forward(tokens),
            TokenComponent::Blosum {
                blosum,
                special_token_embeddings,
            } => {
                let special = tokens.mapv(|t| if t < NUM_SPECIAL_TOKENS { t } else { NULL });
                Ok(special_token_embeddings.forward(&special.view())? + blosum.forward(tokens)?)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PositionComponent {
    /// one channel, (p - 1) / (len - 1)
    Relative,
    Sinusoidal(Embedding),
    /// forward table at p concatenated with backward table at len - p + 1
    Bidirectional(Embedding),
}

impl PositionComponent {
    fn dim(&self) -> usize {
        match self {
            PositionComponent::Relative => 1,
            PositionComponent::Sinusoidal(table) => table.embedding_dim(),
            PositionComponent::Bidirectional(table) => 2 * table.embedding_dim(),
        }
    }

    fn forward(&self, positions: &ArrayView1<usize>, lengths: &ArrayView1<usize>) -> Result<Array2<f32>> {
        match self {
            PositionComponent::Relative => {
                let relative = Array1::from_iter(positions.iter().zip(lengths.iter()).map(|(&p, &len)| {
                    if p == NULL {
                        0.
                    } else if len <= 1 {
                        RELATIVE_POSITION_OF_SINGLETON
                    } else {
                        (p - 1) as f32 / (len - 1) as f32
                    }
                }));
                Ok(relative.insert_axis(Axis(1)))
            }
            PositionComponent::Sinusoidal(table) => table.forward(positions),
            PositionComponent::Bidirectional(table) => {
                let backward = Array1::from_iter(positions.iter().zip(lengths.iter()).map(|(&p, &len)| {
                    if p == NULL {
                        NULL
                    } else {
                        (len + 1).saturating_sub(p)
                    }
                }));
                let forward_component = table.forward(positions)?;
                let backward_component = table.forward(&backward.view())?;
                Ok(concatenate(
                    Axis(1),
                    &[forward_component.view(), backward_component.view()],
                )?)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CompartmentComponent {
    Absent,
    OneHot(Embedding),
    Learned(Embedding),
}

impl CompartmentComponent {
    fn dim(&self) -> usize {
        match self {
            CompartmentComponent::Absent => 0,
            CompartmentComponent::OneHot(table) => table.embedding_dim(),
            CompartmentComponent::Learned(embedding) => embedding.embedding_dim(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Combination {
    /// components side by side
    Concatenate,
    /// components summed and scaled by sqrt(embedding_dim)
    ScaledSum,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenEmbedder {
    pub name: String,
    pub token: TokenComponent,
    pub position: PositionComponent,
    pub compartment: CompartmentComponent,
    pub combination: Combination,
    /// compartment scheme of the tokens this embedder understands
    pub compartment_scheme: CompartmentScheme,
}

impl TokenEmbedder {
    /// Fixed one-hot token, relative position and one-hot compartment,
    /// concatenated.
    pub fn simple(name: &str, scheme: CompartmentScheme) -> TokenEmbedder {
        let compartment = match scheme {
            CompartmentScheme::Absent => CompartmentComponent::Absent,
            _ => CompartmentComponent::OneHot(Embedding::from_table(one_hot_table(
                scheme.num_compartments() + 1,
            ))),
        };
        TokenEmbedder {
            name: name.to_string(),
            token: TokenComponent::OneHot(Embedding::from_table(one_hot_table(
                TokenVocabulary::AminoAcid.size(),
            ))),
            position: PositionComponent::Relative,
            compartment,
            combination: Combination::Concatenate,
            compartment_scheme: scheme,
        }
    }

    pub fn blosum<R: Rng>(name: &str, scheme: CompartmentScheme, rng: &mut R) -> TokenEmbedder {
        let mut embedder = TokenEmbedder::simple(name, scheme);
        embedder.token = TokenComponent::Blosum {
            blosum: Embedding::from_table(blosum_table()),
            special_token_embeddings: Embedding::new(NUM_SPECIAL_TOKENS, NUM_AMINO_ACIDS, Some(NULL), rng),
        };
        embedder
    }

    /// Learned token and compartment tables with a sinusoidal position
    /// table, summed and scaled.
    pub fn learned<R: Rng>(
        name: &str,
        scheme: CompartmentScheme,
        embedding_dim: usize,
        bidirectional: bool,
        rng: &mut R,
    ) -> Result<TokenEmbedder> {
        let position = if bidirectional {
            if embedding_dim % 4 != 0 {
                return Err(TcrlmError::configuration(format!(
                    "{} needs an embedding_dim divisible by 4, got {}",
                    name, embedding_dim
                )))?;
            }
            PositionComponent::Bidirectional(Embedding::from_table(sin_position_table(
                MAX_PLAUSIBLE_CDR_LENGTH,
                embedding_dim / 2,
                DEFAULT_SIN_SCALE_FACTOR,
            )?))
        } else {
            PositionComponent::Sinusoidal(Embedding::from_table(sin_position_table(
                MAX_PLAUSIBLE_CDR_LENGTH,
                embedding_dim,
                DEFAULT_SIN_SCALE_FACTOR,
            )?))
        };
        let compartment = match scheme {
            CompartmentScheme::Absent => CompartmentComponent::Absent,
            _ => CompartmentComponent::Learned(Embedding::new(
                scheme.num_compartments() + 1,
                embedding_dim,
                Some(NULL),
                rng,
            )),
        };
        Ok(TokenEmbedder {
            name: name.to_string(),
            token: TokenComponent::Learned(Embedding::new(
                TokenVocabulary::AminoAcid.size(),
                embedding_dim,
                Some(NULL),
                rng,
            )),
            position,
            compartment,
            combination: Combination::ScaledSum,
            compartment_scheme: scheme,
        })
    }

    /// Width of one embedded token
    pub fn embedding_dim(&self) -> usize {
        match self.combination {
            Combination::Concatenate => {
                self.token.dim() + self.position.dim() + self.compartment.dim()
            }
            Combination::ScaledSum => self.token.dim(),
        }
    }

    pub fn check_compatible_with(&self, tokeniser: &Tokeniser) -> Result<()> {
        if tokeniser.compartment_scheme() != self.compartment_scheme {
            return Err(TcrlmError::configuration(format!(
                "{} expects {:?} compartments but {} produces {:?}",
                self.name,
                self.compartment_scheme,
                tokeniser.name(),
                tokeniser.compartment_scheme()
            )))?;
        }
        Ok(())
    }

    /// (L, fields) token vectors of one sequence -> (L, embedding_dim)
    pub fn forward(&self, tokens: &ArrayView2<usize>) -> Result<Array2<f32>> {
        let token_component = self.token.forward(&tokens.column(TOKEN_ID_FIELD))?;
        let position_component = self.position.forward(
            &tokens.column(POSITION_FIELD),
            &tokens.column(COMPARTMENT_LENGTH_FIELD),
        )?;
        let compartment_component = match &self.compartment {
            CompartmentComponent::Absent => None,
            CompartmentComponent::OneHot(table) | CompartmentComponent::Learned(table) => {
                if tokens.ncols() <= COMPARTMENT_ID_FIELD {
                    return Err(TcrlmError::configuration(format!(
                        "{} needs a compartment field in its token vectors",
                        self.name
                    )))?;
                }
                Some(table.forward(&tokens.column(COMPARTMENT_ID_FIELD))?)
            }
        };

        match self.combination {
            Combination::Concatenate => {
                let mut parts = vec![token_component.view(), position_component.view()];
                if let Some(c) = &compartment_component {
                    parts.push(c.view());
                }
                Ok(concatenate(Axis(1), &parts)?)
            }
            Combination::ScaledSum => {
                let mut summed = token_component + &position_component;
                if let Some(c) = &compartment_component {
                    summed += c;
                }
                Ok(summed * (self.embedding_dim() as f32).sqrt())
            }
        }
    }
}

impl Module for TokenEmbedder {
    fn named_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, Parameter<'a>)>) {
        match &self.token {
            TokenComponent::Learned(embedding) => {
                embedding.named_parameters(&join(prefix, "token_embedding"), out)
            }
            TokenComponent::Blosum {
                special_token_embeddings,
                ..
            } => special_token_embeddings.named_parameters(
                &join(prefix, "_blosum_embedding._special_token_embeddings"),
                out,
            ),
            TokenComponent::OneHot(_) => (),
        }
        if let CompartmentComponent::Learned(embedding) = &self.compartment {
            embedding.named_parameters(&join(prefix, "compartment_embedding"), out);
        }
    }

    fn named_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ParameterMut<'a>)>,
    ) {
        match &mut self.token {
            TokenComponent::Learned(embedding) => {
                embedding.named_parameters_mut(&join(prefix, "token_embedding"), out)
            }
            TokenComponent::Blosum {
                special_token_embeddings,
                ..
            } => special_token_embeddings.named_parameters_mut(
                &join(prefix, "_blosum_embedding._special_token_embeddings"),
                out,
            ),
            TokenComponent::OneHot(_) => (),
        }
        if let CompartmentComponent::Learned(embedding) = &mut self.compartment {
            embedding.named_parameters_mut(&join(prefix, "compartment_embedding"), out);
        }
    }
}

impl TokenEmbedder {
    /// Zero the padding rows again, e.g. after loading parameters.
    pub fn reset_padding_rows(&mut self) {
        match &mut self.token {
            TokenComponent::Learned(e) => e.reset_padding_row(),
            TokenComponent::Blosum {
                special_token_embeddings,
                ..
            } => special_token_embeddings.reset_padding_row(),
            TokenComponent::OneHot(_) => (),
        }
        if let CompartmentComponent::Learned(e) = &mut self.compartment {
            e.reset_padding_row();
        }
    }
}
