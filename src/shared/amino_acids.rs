//! Amino-acid alphabet, reserved token indices and compartment enumerations.
//! Token ids are part of the trained parameter layout and must never change.

use anyhow::{anyhow, Result};
use phf::phf_map;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Padding / "no value" index, shared by every field of a token vector.
pub const NULL: usize = 0;
pub const MASK: usize = 1;
pub const CLS: usize = 2;
pub const NUM_SPECIAL_TOKENS: usize = 3;

pub const NUM_AMINO_ACIDS: usize = 20;

/// The 20 canonical residues, in token-id order (id = 3 + position).
pub const AMINO_ACIDS: [u8; NUM_AMINO_ACIDS] = *b"ACDEFGHIKLMNPQRSTVWY";

static AMINO_ACID_TOKEN: phf::Map<u8, usize> = phf_map! {
    b'A' => 3, b'C' => 4, b'D' => 5, b'E' => 6, b'F' => 7,
    b'G' => 8, b'H' => 9, b'I' => 10, b'K' => 11, b'L' => 12,
    b'M' => 13, b'N' => 14, b'P' => 15, b'Q' => 16, b'R' => 17,
    b'S' => 18, b'T' => 19, b'V' => 20, b'W' => 21, b'Y' => 22,
};

pub fn amino_acid_token(aa: u8) -> Option<usize> {
    AMINO_ACID_TOKEN.get(&aa).copied()
}

pub fn is_special_token(token: usize) -> bool {
    token < NUM_SPECIAL_TOKENS
}

/// Alphabet a tokeniser draws its token ids from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenVocabulary {
    AminoAcid,
}

impl TokenVocabulary {
    /// Number of ids including the special ones.
    pub fn size(&self) -> usize {
        match self {
            TokenVocabulary::AminoAcid => NUM_SPECIAL_TOKENS + NUM_AMINO_ACIDS,
        }
    }

    /// Sorted ids that can stand in for a residue.
    pub fn non_special_tokens(&self) -> Vec<usize> {
        (NUM_SPECIAL_TOKENS..self.size()).collect()
    }
}

/// Which structural regions the compartment field enumerates.
/// Id 0 is always "no compartment" (CLS and padding).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompartmentScheme {
    /// CDR1A=1, CDR2A=2, CDR3A=3, CDR1B=4, CDR2B=5, CDR3B=6
    Cdr,
    /// CDR1=1, CDR2=2, CDR3=3
    SingleChainCdr,
    /// CDR3A=1, CDR3B=2
    Cdr3,
    /// Token vectors carry no compartment field.
    Absent,
}

impl CompartmentScheme {
    pub fn num_compartments(&self) -> usize {
        match self {
            CompartmentScheme::Cdr => 6,
            CompartmentScheme::SingleChainCdr => 3,
            CompartmentScheme::Cdr3 => 2,
            CompartmentScheme::Absent => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AminoAcid {
    pub seq: Vec<u8>,
}

impl fmt::Display for AminoAcid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.seq))
    }
}

impl AminoAcid {
    pub fn from_string(s: &str) -> Result<AminoAcid> {
        for &byte in s.as_bytes() {
            if !AMINO_ACID_TOKEN.contains_key(&byte) {
                return Err(anyhow!(
                    "Invalid amino-acid {} in sequence {}",
                    byte as char,
                    s
                ));
            }
        }
        Ok(AminoAcid {
            seq: s.as_bytes().to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    pub fn token_indices(&self) -> Vec<usize> {
        // sequences are validated on construction
        self.seq
            .iter()
            .map(|&aa| AMINO_ACID_TOKEN.get(&aa).copied().unwrap_or(NULL))
            .collect()
    }
}

// BLOSUM62, rows and columns in the usual ARNDCQEGHILKMFPSTWYV order.
const BLOSUM62_ORDER: &[u8; NUM_AMINO_ACIDS] = b"ARNDCQEGHILKMFPSTWYV";
#[rustfmt::skip]
const BLOSUM62: [[i8; NUM_AMINO_ACIDS]; NUM_AMINO_ACIDS] = [
    [ 4, -1, -2, -2,  0, -1, -1,  0, -2, -1, -1, -1, -1, -2, -1,  1,  0, -3, -2,  0],
    [-1,  5,  0, -2, -3,  1,  0, -2,  0, -3, -2,  2, -1, -3, -2, -1, -1, -3, -2, -3],
    [-2,  0,  6,  1, -3,  0,  0,  0,  1, -3, -3,  0, -2, -3, -2,  1,  0, -4, -2, -3],
    [-2, -2,  1,  6, -3,  0,  2, -1, -1, -3, -4, -1, -3, -3, -1,  0, -1, -4, -3, -3],
    [ 0, -3, -3, -3,  9, -3, -4, -3, -3, -1, -1, -3, -1, -2, -3, -1, -1, -2, -2, -1],
    [-1,  1,  0,  0, -3,  5,  2, -2,  0, -3, -2,  1,  0, -3, -1,  0, -1, -2, -1, -2],
    [-1,  0,  0,  2, -4,  2,  5, -2,  0, -3, -3,  1, -2, -3, -1,  0, -1, -3, -2, -2],
    [ 0, -2,  0, -1, -3, -2, -2,  6, -2, -4, -4, -2, -3, -3, -2,  0, -2, -2, -3, -3],
    [-2,  0,  1, -1, -3,  0,  0, -2,  8, -3, -3, -1, -2, -1, -2, -1, -2, -2,  2, -3],
    [-1, -3, -3, -3, -1, -3, -3, -4, -3,  4,  2, -3,  1,  0, -3, -2, -1, -3, -1,  3],
    [-1, -2, -3, -4, -1, -2, -3, -4, -3,  2,  4, -2,  2,  0, -3, -2, -1, -2, -1,  1],
    [-1,  2,  0, -1, -3,  1,  1, -2, -1, -3, -2,  5, -1, -3, -1,  0, -1, -3, -2, -2],
    [-1, -1, -2, -3, -1,  0, -2, -3, -2,  1,  2, -1,  5,  0, -2, -1, -1, -1, -1,  1],
    [-2, -3, -3, -3, -2, -3, -3, -3, -1,  0,  0, -3,  0,  6, -4, -2, -2,  1,  3, -1],
    [-1, -2, -2, -1, -3, -1, -1, -2, -2, -3, -3, -1, -2, -4,  7, -1, -1, -4, -3, -2],
    [ 1, -1,  1,  0, -1,  0,  0,  0, -1, -2, -2,  0, -1, -2, -1,  4,  1, -3, -2, -2],
    [ 0, -1,  0, -1, -1, -1, -1, -2, -2, -1, -1, -1, -1, -2, -1,  1,  5, -2, -2,  0],
    [-3, -3, -4, -4, -2, -2, -3, -2, -2, -3, -2, -3, -1,  1, -4, -3, -2, 11,  2, -3],
    [-2, -2, -2, -3, -2, -1, -2, -3,  2, -1, -1, -2, -1,  3, -3, -2, -2,  2,  7, -1],
    [ 0, -3, -3, -3, -1, -2, -2, -3, -3,  3,  1, -2,  1, -1, -2, -2,  0, -3, -1,  4],
];

/// BLOSUM62 score between two residues (single-letter codes).
pub fn blosum62(a: u8, b: u8) -> Option<i8> {
    let i = BLOSUM62_ORDER.iter().position(|&x| x == a)?;
    let j = BLOSUM62_ORDER.iter().position(|&x| x == b)?;
    Some(BLOSUM62[i][j])
}
