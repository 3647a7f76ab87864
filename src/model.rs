//! The representation model exposed to callers, and a lazily loaded
//! default instance for the functional API.
use crate::collator::pad_tokenised_sequences;
use crate::config::{Config, ConfigReader};
use crate::nn::state_dict::{read_state_dict, write_state_dict};
use crate::nn::{Bert, Device};
use crate::shared::amino_acids::CompartmentScheme;
use crate::shared::{
    cdist_from_representations, pdist_from_representations, GeneOracle, ReferenceGeneTable, Tcr,
    TcrTable, TcrlmError,
};
use crate::tokeniser::{TokenSequence, Tokeniser, COMPARTMENT_ID_FIELD};
use anyhow::Result;
use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use once_cell::sync::OnceCell;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fmt;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const BATCH_SIZE_DEFAULT: usize = 512;
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const STATE_DICT_FILE_NAME: &str = "state_dict.json";
/// Environment variable pointing to the save directory of the default model
pub const DEFAULT_MODEL_ENV: &str = "TCRLM_DEFAULT_MODEL";
pub const DEFAULT_MODEL_DIR: &str = "model_saves/SCEPTR";

/// Penultimate-layer representations of every residue, CLS excluded.
#[derive(Clone, Debug, PartialEq)]
pub struct ResidueRepresentations {
    /// (N, M, D), M the longest tokenised TCR minus its CLS
    pub representation_array: Array3<f32>,
    /// (N, M), 0 for padding and 1..=6 for CDR1A..CDR3B
    pub compartment_mask: Array2<usize>,
}

impl ResidueRepresentations {
    pub fn num_tcrs(&self) -> usize {
        self.representation_array.len_of(Axis(0))
    }

    pub fn rep_dim(&self) -> usize {
        self.representation_array.len_of(Axis(2))
    }
}

impl fmt::Display for ResidueRepresentations {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ResidueRepresentations[num_tcrs: {}, rep_dim: {}]",
            self.num_tcrs(),
            self.rep_dim()
        )
    }
}

#[derive(Clone)]
pub struct Sceptr {
    pub name: String,
    config: Config,
    tokeniser: Tokeniser,
    bert: Bert,
    oracle: Arc<dyn GeneOracle>,
    device: Device,
    batch_size: usize,
}

impl fmt::Debug for Sceptr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Sceptr")
            .field("name", &self.name)
            .field("tokeniser", &self.tokeniser.name())
            .field("d_model", &self.bert.d_model())
            .field("device", &self.device)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Sceptr {
    pub fn new(config: Config, tokeniser: Tokeniser, bert: Bert) -> Result<Sceptr> {
        bert.token_embedder.check_compatible_with(&tokeniser)?;
        Ok(Sceptr {
            name: config.model.name.clone(),
            config,
            tokeniser,
            bert,
            oracle: Arc::new(ReferenceGeneTable::builtin().clone()),
            device: Device::Cpu,
            batch_size: BATCH_SIZE_DEFAULT,
        })
    }

    /// Fresh parameters drawn from `seed`, or the pretrained state named in
    /// the config.
    pub fn from_config(config: Config, base_dir: &Path, seed: u64) -> Result<Sceptr> {
        let reader = ConfigReader::new(config);
        let mut rng = SmallRng::seed_from_u64(seed);
        let bert = reader.get_bert_with_pretrained_parameters_if_available(base_dir, &mut rng)?;
        let tokeniser = reader.get_tokeniser()?;
        Sceptr::new(reader.get_config().clone(), tokeniser, bert)
    }

    /// Load a save directory holding `config.json` and either
    /// `state_dict.json` or a config naming a pretrained state.
    pub fn load(dir: &Path) -> Result<Sceptr> {
        let reader = ConfigReader::from_path(&dir.join(CONFIG_FILE_NAME))?;
        let mut rng = SmallRng::seed_from_u64(0);
        let state_dict_path = dir.join(STATE_DICT_FILE_NAME);
        let bert = if state_dict_path.exists() {
            let mut bert = reader.get_bert(&mut rng)?;
            bert.load_state_dict(&read_state_dict(&state_dict_path)?)?;
            bert
        } else if reader.get_config().model.path_to_pretrained_state_dict.is_some() {
            reader.get_bert_with_pretrained_parameters_if_available(dir, &mut rng)?
        } else {
            return Err(TcrlmError::configuration(format!(
                "{} has no {} and its config names no pretrained state",
                dir.display(),
                STATE_DICT_FILE_NAME
            ))
            .into());
        };
        let tokeniser = reader.get_tokeniser()?;
        log::info!("Loaded model {} from {}", reader.get_model_name(), dir.display());
        Sceptr::new(reader.get_config().clone(), tokeniser, bert)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut config = self.config.clone();
        config.model.path_to_pretrained_state_dict = None;
        let writer = BufWriter::new(File::create(dir.join(CONFIG_FILE_NAME))?);
        serde_json::to_writer_pretty(writer, &config)?;
        write_state_dict(&self.bert.state_dict(), &dir.join(STATE_DICT_FILE_NAME))?;
        log::info!("Saved model {} to {}", self.name, dir.display());
        Ok(())
    }

    pub fn with_gene_oracle(mut self, oracle: Arc<dyn GeneOracle>) -> Sceptr {
        self.oracle = oracle;
        self
    }

    pub fn tokeniser(&self) -> &Tokeniser {
        &self.tokeniser
    }

    pub fn bert(&self) -> &Bert {
        &self.bert
    }

    pub fn bert_mut(&mut self) -> &mut Bert {
        &mut self.bert
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(TcrlmError::configuration("batch size must be positive"))?;
        }
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn enable_hardware_acceleration(&mut self) {
        log::info!("{}: hardware acceleration enabled", self.name);
        self.device = Device::Accelerated;
    }

    pub fn disable_hardware_acceleration(&mut self) {
        log::info!("{}: hardware acceleration disabled", self.name);
        self.device = Device::Cpu;
    }

    /// (N, d_model) unit vectors, row i for table row i
    pub fn calc_vector_representations(&self, table: &TcrTable) -> Result<Array2<f32>> {
        let tcrs = table.generate_tcr_series(self.oracle.as_ref())?;
        let mut batches = vec![];
        for (batch_index, chunk) in tcrs.chunks(self.batch_size).enumerate() {
            let tokenised = self.tokenise_batch(chunk, batch_index * self.batch_size)?;
            batches.push(self.bert.get_vector_representations_of(&tokenised, self.device)?);
        }
        if batches.is_empty() {
            return Ok(Array2::zeros((0, self.bert.d_model())));
        }
        let views: Vec<_> = batches.iter().map(|b| b.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// (X, Y) euclidean distances between the rows of the two tables
    pub fn calc_cdist_matrix(&self, anchors: &TcrTable, comparisons: &TcrTable) -> Result<Array2<f32>> {
        let anchor_reps = self.calc_vector_representations(anchors)?;
        let comparison_reps = self.calc_vector_representations(comparisons)?;
        Ok(cdist_from_representations(&anchor_reps, &comparison_reps))
    }

    /// Condensed (N * (N - 1) / 2,) distances between the rows of `table`
    pub fn calc_pdist_vector(&self, table: &TcrTable) -> Result<Array1<f32>> {
        let reps = self.calc_vector_representations(table)?;
        Ok(pdist_from_representations(&reps))
    }

    pub fn calc_residue_representations(&self, table: &TcrTable) -> Result<ResidueRepresentations> {
        if self.tokeniser.compartment_scheme() != CompartmentScheme::Cdr {
            return Err(TcrlmError::Unsupported(format!(
                "residue representations need the paired CDR schema, {} does not provide it",
                self.tokeniser.name()
            )))?;
        }

        let tcrs = table.generate_tcr_series(self.oracle.as_ref())?;
        let mut batches = vec![];
        for (batch_index, chunk) in tcrs.chunks(self.batch_size).enumerate() {
            let tokenised = self.tokenise_batch(chunk, batch_index * self.batch_size)?;
            let reps = self
                .bert
                .get_token_embeddings_at_penultimate_layer(&tokenised, self.device)?;
            let residues = reps.slice(s![.., 1.., ..]).to_owned();
            let compartments = tokenised.slice(s![.., 1.., COMPARTMENT_ID_FIELD]).to_owned();
            batches.push((residues, compartments));
        }

        let d_model = self.bert.d_model();
        let max_residues = batches
            .iter()
            .map(|(_, c)| c.ncols())
            .max()
            .unwrap_or(0);
        let mut representation_array = Array3::zeros((tcrs.len(), max_residues, d_model));
        let mut compartment_mask = Array2::zeros((tcrs.len(), max_residues));
        let mut offset = 0;
        for (residues, compartments) in batches {
            let (n, m) = compartments.dim();
            representation_array
                .slice_mut(s![offset..offset + n, ..m, ..])
                .assign(&residues);
            compartment_mask
                .slice_mut(s![offset..offset + n, ..m])
                .assign(&compartments);
            offset += n;
        }

        Ok(ResidueRepresentations {
            representation_array,
            compartment_mask,
        })
    }

    /// Tokenise and pad one batch. Row indices in errors start at
    /// `first_row`.
    fn tokenise_batch(&self, tcrs: &[Tcr], first_row: usize) -> Result<Array3<usize>> {
        let tokenised: Vec<TokenSequence> = match self.device {
            Device::Cpu => tcrs
                .iter()
                .enumerate()
                .map(|(i, tcr)| self.tokeniser.tokenise(tcr, first_row + i))
                .collect::<Result<_>>()?,
            Device::Accelerated => tcrs
                .par_iter()
                .enumerate()
                .map(|(i, tcr)| self.tokeniser.tokenise(tcr, first_row + i))
                .collect::<Result<_>>()?,
        };
        Ok(pad_tokenised_sequences(&tokenised, self.tokeniser.num_fields()))
    }
}

/// Handle on a model that is read from disk the first time it is needed.
/// Acceleration settings made before loading are applied on load.
#[derive(Debug)]
pub struct DefaultModel {
    save_dir: PathBuf,
    device: Device,
    model: OnceCell<Sceptr>,
}

impl Default for DefaultModel {
    fn default() -> DefaultModel {
        let dir = std::env::var(DEFAULT_MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL_DIR.to_string());
        DefaultModel::new(Path::new(&dir))
    }
}

impl DefaultModel {
    pub fn new(save_dir: &Path) -> DefaultModel {
        DefaultModel {
            save_dir: save_dir.to_path_buf(),
            device: Device::Cpu,
            model: OnceCell::new(),
        }
    }

    /// Wrap a model that is already in memory
    pub fn from_model(model: Sceptr) -> DefaultModel {
        let device = model.device();
        DefaultModel {
            save_dir: PathBuf::new(),
            device,
            model: OnceCell::with_value(model),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    pub fn model(&self) -> Result<&Sceptr> {
        self.model.get_or_try_init(|| {
            log::debug!("Loading default model from {}", self.save_dir.display());
            let mut model = Sceptr::load(&self.save_dir)?;
            if self.device == Device::Accelerated {
                model.enable_hardware_acceleration();
            }
            Ok(model)
        })
    }

    pub fn enable_hardware_acceleration(&mut self) {
        self.device = Device::Accelerated;
        if let Some(model) = self.model.get_mut() {
            model.enable_hardware_acceleration();
        }
    }

    pub fn disable_hardware_acceleration(&mut self) {
        self.device = Device::Cpu;
        if let Some(model) = self.model.get_mut() {
            model.disable_hardware_acceleration();
        }
    }
}

pub fn calc_vector_representations(model: &DefaultModel, table: &TcrTable) -> Result<Array2<f32>> {
    model.model()?.calc_vector_representations(table)
}

pub fn calc_cdist_matrix(model: &DefaultModel, anchors: &TcrTable, comparisons: &TcrTable) -> Result<Array2<f32>> {
    model.model()?.calc_cdist_matrix(anchors, comparisons)
}

pub fn calc_pdist_vector(model: &DefaultModel, table: &TcrTable) -> Result<Array1<f32>> {
    model.model()?.calc_pdist_vector(table)
}

pub fn calc_residue_representations(model: &DefaultModel, table: &TcrTable) -> Result<ResidueRepresentations> {
    model.model()?.calc_residue_representations(table)
}
