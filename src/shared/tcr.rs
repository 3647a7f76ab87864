//! Typed TCR / pMHC records built from raw gene symbols and junctions
use crate::shared::gene::{parse_gene_symbol, CdrSequences, Chain, GeneOracle};
use crate::shared::AminoAcid;
use anyhow::{anyhow, Result};
use std::fmt;

/// A V gene with its allele. CDR1/CDR2 are resolved from the gene oracle
/// when the object is built, an unknown gene has no CDRs.
#[derive(Clone, Debug, Default)]
pub struct Tcrv {
    gene: Option<String>,
    allele_num: Option<u32>,
    cdrs: Option<CdrSequences>,
}

impl PartialEq for Tcrv {
    fn eq(&self, other: &Tcrv) -> bool {
        self.gene == other.gene && self.allele_num == other.allele_num
    }
}

impl Eq for Tcrv {}

impl fmt::Display for Tcrv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.gene, self.allele_num) {
            (Some(gene), Some(allele)) => write!(f, "{}*{:02}", gene, allele),
            (Some(gene), None) => write!(f, "{}", gene),
            _ => write!(f, "?"),
        }
    }
}

impl Tcrv {
    pub fn unknown() -> Tcrv {
        Tcrv::default()
    }

    /// The allele defaults to 1 when unspecified.
    pub fn new(gene: &str, allele_num: Option<u32>, oracle: &dyn GeneOracle) -> Result<Tcrv> {
        if !oracle.is_known_gene(gene) {
            return Err(anyhow!("{} is not a known functional V gene", gene));
        }
        let allele_num = allele_num.unwrap_or(1);
        let cdrs = oracle
            .cdr_sequences(gene, allele_num)
            .ok_or(anyhow!("No reference data for {}*{:02}", gene, allele_num))?;
        Ok(Tcrv {
            gene: Some(gene.to_string()),
            allele_num: Some(allele_num),
            cdrs: Some(cdrs),
        })
    }

    pub fn from_symbol(symbol: Option<&str>, chain: Chain, oracle: &dyn GeneOracle) -> Result<Tcrv> {
        let Some(symbol) = symbol else {
            return Ok(Tcrv::unknown());
        };
        let parsed = parse_gene_symbol(symbol)?;
        if parsed.chain != chain {
            return Err(anyhow!(
                "{} is not a {} gene",
                symbol,
                chain.v_prefix()
            ));
        }
        Tcrv::new(&parsed.gene, parsed.allele, oracle)
    }

    pub fn gene(&self) -> Option<&str> {
        self.gene.as_deref()
    }

    pub fn allele_num(&self) -> Option<u32> {
        self.allele_num
    }

    pub fn is_unknown(&self) -> bool {
        self.gene.is_none()
    }

    pub fn cdr1_sequence(&self) -> Option<&AminoAcid> {
        self.cdrs.as_ref().map(|c| &c.cdr1)
    }

    pub fn cdr2_sequence(&self) -> Option<&AminoAcid> {
        self.cdrs.as_ref().map(|c| &c.cdr2)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tcr {
    trav: Tcrv,
    pub junction_a_sequence: Option<AminoAcid>,
    trbv: Tcrv,
    pub junction_b_sequence: Option<AminoAcid>,
}

impl fmt::Display for Tcr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Tra({}/{})/Trb({}/{})",
            self.trav,
            represent_junction(&self.junction_a_sequence),
            self.trbv,
            represent_junction(&self.junction_b_sequence)
        )
    }
}

fn represent_junction(junction: &Option<AminoAcid>) -> String {
    junction
        .as_ref()
        .map_or("?".to_string(), |j| j.to_string())
}

impl Tcr {
    pub fn new(
        trav: Tcrv,
        junction_a_sequence: Option<AminoAcid>,
        trbv: Tcrv,
        junction_b_sequence: Option<AminoAcid>,
    ) -> Tcr {
        Tcr {
            trav,
            junction_a_sequence,
            trbv,
            junction_b_sequence,
        }
    }

    pub fn trav(&self) -> &Tcrv {
        &self.trav
    }

    pub fn trbv(&self) -> &Tcrv {
        &self.trbv
    }

    pub fn cdr1a_sequence(&self) -> Option<&AminoAcid> {
        self.trav.cdr1_sequence()
    }

    pub fn cdr2a_sequence(&self) -> Option<&AminoAcid> {
        self.trav.cdr2_sequence()
    }

    pub fn cdr1b_sequence(&self) -> Option<&AminoAcid> {
        self.trbv.cdr1_sequence()
    }

    pub fn cdr2b_sequence(&self) -> Option<&AminoAcid> {
        self.trbv.cdr2_sequence()
    }

    pub fn tra_specified(&self) -> bool {
        !self.trav.is_unknown() || self.junction_a_sequence.is_some()
    }

    pub fn trb_specified(&self) -> bool {
        !self.trbv.is_unknown() || self.junction_b_sequence.is_some()
    }

    pub fn both_chains_specified(&self) -> bool {
        self.tra_specified() && self.trb_specified()
    }

    pub fn drop_tra(&mut self) {
        self.trav = Tcrv::unknown();
        self.junction_a_sequence = None;
    }

    pub fn drop_trb(&mut self) {
        self.trbv = Tcrv::unknown();
        self.junction_b_sequence = None;
    }
}

pub fn make_tcr_from_components(
    trav_symbol: Option<&str>,
    junction_a_sequence: Option<&str>,
    trbv_symbol: Option<&str>,
    junction_b_sequence: Option<&str>,
    oracle: &dyn GeneOracle,
) -> Result<Tcr> {
    Ok(Tcr {
        trav: Tcrv::from_symbol(trav_symbol, Chain::Alpha, oracle)?,
        junction_a_sequence: junction_a_sequence.map(AminoAcid::from_string).transpose()?,
        trbv: Tcrv::from_symbol(trbv_symbol, Chain::Beta, oracle)?,
        junction_b_sequence: junction_b_sequence.map(AminoAcid::from_string).transpose()?,
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MhcGene {
    pub symbol: Option<String>,
}

impl MhcGene {
    pub fn new(symbol: Option<&str>) -> MhcGene {
        MhcGene {
            symbol: symbol.map(|s| s.to_string()),
        }
    }

    /// Unknown alleles match anything, known ones match when one symbol
    /// is a refinement of the other (e.g. HLA-A*02 and HLA-A*02:01).
    pub fn could_be_equal_to(&self, other: &MhcGene) -> bool {
        match (&self.symbol, &other.symbol) {
            (Some(a), Some(b)) => a.contains(b.as_str()) || b.contains(a.as_str()),
            _ => true,
        }
    }
}

impl fmt::Display for MhcGene {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.symbol.as_deref().unwrap_or("?"))
    }
}

#[derive(Clone, Debug, Default)]
pub struct Pmhc {
    pub epitope_sequence: Option<String>,
    pub mhc_a: MhcGene,
    pub mhc_b: MhcGene,
}

/// Not reflexive: a pMHC with an unknown epitope equals nothing, itself
/// included.
impl PartialEq for Pmhc {
    fn eq(&self, other: &Pmhc) -> bool {
        match &self.epitope_sequence {
            None => false,
            Some(epitope) => {
                other.epitope_sequence.as_ref() == Some(epitope)
                    && self.mhc_a.could_be_equal_to(&other.mhc_a)
                    && self.mhc_b.could_be_equal_to(&other.mhc_b)
            }
        }
    }
}

impl fmt::Display for Pmhc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.epitope_sequence.as_deref().unwrap_or("?"),
            self.mhc_a,
            self.mhc_b
        )
    }
}

pub fn make_pmhc_from_components(
    epitope_sequence: Option<&str>,
    mhc_a_symbol: Option<&str>,
    mhc_b_symbol: Option<&str>,
) -> Pmhc {
    Pmhc {
        epitope_sequence: epitope_sequence.map(|s| s.to_string()),
        mhc_a: MhcGene::new(mhc_a_symbol),
        mhc_b: MhcGene::new(mhc_b_symbol),
    }
}

#[derive(Clone, Debug, Default)]
pub struct TcrPmhcPair {
    pub tcr: Tcr,
    pub pmhc: Pmhc,
}

impl TcrPmhcPair {
    pub fn new(tcr: Tcr, pmhc: Pmhc) -> TcrPmhcPair {
        TcrPmhcPair { tcr, pmhc }
    }
}

impl fmt::Display for TcrPmhcPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}) - ({})", self.tcr, self.pmhc)
    }
}
