//! Deal with TRAV/TRBV gene names and the germline CDR1/CDR2 lookup
use crate::shared::AminoAcid;
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Read;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Alpha,
    Beta,
}

impl Chain {
    /// IMGT locus prefix of the V genes of this chain
    pub fn v_prefix(&self) -> &'static str {
        match self {
            Chain::Alpha => "TRAV",
            Chain::Beta => "TRBV",
        }
    }
}

/// Parsed `<GENE>[*<NN>]` symbol.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeneSymbol {
    pub chain: Chain,
    // e.g. TRAV38-2/DV8
    pub gene: String,
    // None if the symbol had no `*NN` suffix
    pub allele: Option<u32>,
}

impl fmt::Display for GeneSymbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.allele {
            Some(a) => write!(f, "{}*{:02}", self.gene, a),
            None => write!(f, "{}", self.gene),
        }
    }
}

static GENE_SYMBOL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(TRA|TRB)V(\d+)(?:-(\d+))?(?:/(DV\d+))?(?:\*(\d{2}))?$")
        .expect("static regex is valid")
});

pub fn parse_gene_symbol(symbol: &str) -> Result<GeneSymbol> {
    let g = GENE_SYMBOL_REGEX
        .captures(symbol.trim())
        .ok_or(anyhow!("Gene {} does not have a valid name", symbol))?;

    let chain = match g.get(1).map_or("", |m| m.as_str()) {
        "TRA" => Chain::Alpha,
        "TRB" => Chain::Beta,
        _ => return Err(anyhow!("Gene {} is neither TRAV nor TRBV", symbol)),
    };
    let allele = g.get(5).and_then(|m| m.as_str().parse::<u32>().ok());
    let gene = match symbol.trim().split_once('*') {
        Some((gene, _)) => gene.to_string(),
        None => symbol.trim().to_string(),
    };

    Ok(GeneSymbol {
        chain,
        gene,
        allele,
    })
}

/// Germline CDR loops of one V allele. `cdr2` is empty when the reference
/// has no CDR2 annotation for the allele.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdrSequences {
    pub cdr1: AminoAcid,
    pub cdr2: AminoAcid,
}

/// Maps V-gene alleles to their germline CDR1/CDR2 sequences.
pub trait GeneOracle: Send + Sync {
    /// True if `gene` (without allele) belongs to the curated functional set
    fn is_known_gene(&self, gene: &str) -> bool;
    fn cdr_sequences(&self, gene: &str, allele: u32) -> Option<CdrSequences>;
}

#[derive(Clone, Debug, Default)]
pub struct ReferenceGeneTable {
    genes: HashSet<String>,
    alleles: HashMap<(String, u32), CdrSequences>,
}

#[derive(Deserialize)]
struct ReferenceRecord {
    allele: String,
    cdr1: String,
    #[serde(default)]
    cdr2: Option<String>,
}

impl ReferenceGeneTable {
    pub fn new() -> ReferenceGeneTable {
        ReferenceGeneTable::default()
    }

    pub fn insert(&mut self, allele_symbol: &str, cdr1: &str, cdr2: &str) -> Result<()> {
        let symbol = parse_gene_symbol(allele_symbol)?;
        let allele = symbol.allele.ok_or(anyhow!(
            "Reference entry {} must carry an allele number",
            allele_symbol
        ))?;
        self.genes.insert(symbol.gene.clone());
        self.alleles.insert(
            (symbol.gene, allele),
            CdrSequences {
                cdr1: AminoAcid::from_string(cdr1)?,
                cdr2: AminoAcid::from_string(cdr2)?,
            },
        );
        Ok(())
    }

    /// Load a reference from a csv with columns `allele,cdr1,cdr2`
    pub fn from_csv_reader<R: Read>(rdr: R) -> Result<ReferenceGeneTable> {
        let mut table = ReferenceGeneTable::new();
        let mut reader = csv::Reader::from_reader(rdr);
        for record in reader.deserialize() {
            let record: ReferenceRecord = record?;
            table.insert(
                &record.allele,
                &record.cdr1,
                record.cdr2.as_deref().unwrap_or(""),
            )?;
        }
        Ok(table)
    }

    /// Curated functional human alleles bundled with the crate.
    pub fn builtin() -> &'static ReferenceGeneTable {
        &BUILTIN_REFERENCE
    }

    pub fn len(&self) -> usize {
        self.alleles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alleles.is_empty()
    }
}

impl GeneOracle for ReferenceGeneTable {
    fn is_known_gene(&self, gene: &str) -> bool {
        self.genes.contains(gene)
    }

    fn cdr_sequences(&self, gene: &str, allele: u32) -> Option<CdrSequences> {
        self.alleles.get(&(gene.to_string(), allele)).cloned()
    }
}

/// Functional human TRAV and TRBV alleles with their IMGT CDR1 and CDR2.
const BUILTIN_ALLELES_CSV: &str = include_str!("reference_alleles.csv");

static BUILTIN_REFERENCE: Lazy<ReferenceGeneTable> = Lazy::new(|| {
    ReferenceGeneTable::from_csv_reader(BUILTIN_ALLELES_CSV.as_bytes()).unwrap_or_else(|e| {
        log::error!("Bundled gene reference failed to load: {}", e);
        ReferenceGeneTable::new()
    })
});
