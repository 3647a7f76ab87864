//! Tabular TCR input (`TRAV, CDR3A, TRAJ, TRBV, CDR3B, TRBJ, Epitope, MHCA, MHCB`).
//! Absent columns read as all-null.
use crate::shared::errors::TcrlmError;
use crate::shared::gene::{Chain, GeneOracle};
use crate::shared::tcr::{make_pmhc_from_components, Tcr, TcrPmhcPair, Tcrv};
use crate::shared::AminoAcid;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcrRow {
    #[serde(rename = "TRAV", default)]
    pub trav: Option<String>,
    #[serde(rename = "CDR3A", default)]
    pub cdr3a: Option<String>,
    // J genes are carried along but not tokenised
    #[serde(rename = "TRAJ", default)]
    pub traj: Option<String>,
    #[serde(rename = "TRBV", default)]
    pub trbv: Option<String>,
    #[serde(rename = "CDR3B", default)]
    pub cdr3b: Option<String>,
    #[serde(rename = "TRBJ", default)]
    pub trbj: Option<String>,
    #[serde(rename = "Epitope", default)]
    pub epitope: Option<String>,
    #[serde(rename = "MHCA", default)]
    pub mhca: Option<String>,
    #[serde(rename = "MHCB", default)]
    pub mhcb: Option<String>,
}

impl TcrRow {
    pub fn new(
        trav: Option<&str>,
        cdr3a: Option<&str>,
        trbv: Option<&str>,
        cdr3b: Option<&str>,
    ) -> TcrRow {
        TcrRow {
            trav: trav.map(String::from),
            cdr3a: cdr3a.map(String::from),
            trbv: trbv.map(String::from),
            cdr3b: cdr3b.map(String::from),
            ..Default::default()
        }
    }

    pub fn with_pmhc(mut self, epitope: Option<&str>, mhca: Option<&str>, mhcb: Option<&str>) -> TcrRow {
        self.epitope = epitope.map(String::from);
        self.mhca = mhca.map(String::from);
        self.mhcb = mhcb.map(String::from);
        self
    }
}

/// Missing-value spellings found in exported data frames
fn cell(value: &Option<String>) -> Option<&str> {
    match value.as_deref().map(str::trim) {
        None | Some("") | Some("NA") | Some("NaN") | Some("nan") | Some("None") => None,
        Some(v) => Some(v),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TcrTable {
    rows: Vec<TcrRow>,
}

impl TcrTable {
    pub fn new(rows: Vec<TcrRow>) -> TcrTable {
        TcrTable { rows }
    }

    pub fn from_csv_reader<R: Read>(rdr: R) -> Result<TcrTable> {
        let mut reader = csv::Reader::from_reader(rdr);
        let rows = reader
            .deserialize()
            .collect::<std::result::Result<Vec<TcrRow>, csv::Error>>()?;
        Ok(TcrTable { rows })
    }

    pub fn from_csv_path(path: &Path) -> Result<TcrTable> {
        let file = File::open(path)?;
        TcrTable::from_csv_reader(file)
    }

    pub fn rows(&self) -> &[TcrRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sub-table over `range`, row indices restart at 0
    pub fn slice(&self, start: usize, end: usize) -> TcrTable {
        TcrTable {
            rows: self.rows[start.min(self.len())..end.min(self.len())].to_vec(),
        }
    }

    pub fn generate_tcr_series(&self, oracle: &dyn GeneOracle) -> Result<Vec<Tcr>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| tcr_from_row(idx, row, oracle))
            .collect()
    }

    pub fn generate_tcr_pmhc_series(&self, oracle: &dyn GeneOracle) -> Result<Vec<TcrPmhcPair>> {
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let tcr = tcr_from_row(idx, row, oracle)?;
                let pmhc = make_pmhc_from_components(cell(&row.epitope), cell(&row.mhca), cell(&row.mhcb));
                Ok(TcrPmhcPair::new(tcr, pmhc))
            })
            .collect()
    }
}

pub fn tcr_from_row(idx: usize, row: &TcrRow, oracle: &dyn GeneOracle) -> Result<Tcr> {
    let trav = v_gene_from_cell(idx, "TRAV", cell(&row.trav), Chain::Alpha, oracle)?;
    let trbv = v_gene_from_cell(idx, "TRBV", cell(&row.trbv), Chain::Beta, oracle)?;
    let junction_a = junction_from_cell(idx, "CDR3A", cell(&row.cdr3a))?;
    let junction_b = junction_from_cell(idx, "CDR3B", cell(&row.cdr3b))?;
    Ok(Tcr::new(trav, junction_a, trbv, junction_b))
}

fn v_gene_from_cell(
    row: usize,
    column: &str,
    value: Option<&str>,
    chain: Chain,
    oracle: &dyn GeneOracle,
) -> Result<Tcrv> {
    Tcrv::from_symbol(value, chain, oracle).map_err(|e| {
        log::debug!("Rejecting {} at row {}: {}", column, row, e);
        TcrlmError::GeneSymbol {
            row,
            column: column.to_string(),
            symbol: value.unwrap_or_default().to_string(),
        }
        .into()
    })
}

fn junction_from_cell(row: usize, column: &str, value: Option<&str>) -> Result<Option<AminoAcid>> {
    value
        .map(|v| {
            AminoAcid::from_string(v).map_err(|_| {
                TcrlmError::InvalidSequence {
                    row,
                    column: column.to_string(),
                    sequence: v.to_string(),
                }
                .into()
            })
        })
        .transpose()
}
