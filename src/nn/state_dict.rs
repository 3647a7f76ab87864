//! Serialisable parameter state: `{name: {"shape": [...], "data": [...]}}`
use crate::nn::layers::Module;
use crate::shared::TcrlmError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

pub type StateDict = BTreeMap<String, TensorRecord>;

pub fn state_dict_of<M: Module>(module: &M, prefix: &str) -> StateDict {
    let mut params = Vec::new();
    module.named_parameters(prefix, &mut params);
    params
        .into_iter()
        .map(|(name, p)| {
            (
                name,
                TensorRecord {
                    shape: p.shape(),
                    data: p.to_vec(),
                },
            )
        })
        .collect()
}

/// Every parameter of `module` must be present in `state` with the same
/// shape, and `state` must not hold anything else.
pub fn load_state_dict_into<M: Module>(module: &mut M, prefix: &str, state: &StateDict) -> Result<()> {
    let mut params = Vec::new();
    module.named_parameters_mut(prefix, &mut params);

    let known: HashSet<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
    if let Some(unexpected) = state.keys().find(|k| !known.contains(k.as_str())) {
        return Err(TcrlmError::UnexpectedParameter(unexpected.clone()))?;
    }
    drop(known);

    for (name, param) in params.iter_mut() {
        let record = state
            .get(name)
            .ok_or_else(|| TcrlmError::MissingParameter(name.clone()))?;
        param.assign(name, &record.shape, &record.data)?;
    }
    Ok(())
}

pub fn read_state_dict(path: &Path) -> Result<StateDict> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn write_state_dict(state: &StateDict, path: &Path) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, state)?;
    Ok(())
}
