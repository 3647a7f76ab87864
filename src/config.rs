//! Declarative model configuration and the per-slot component registries.
use crate::collator::{BatchCollator, CollationObjective, DEFAULT_P_CENSOR};
use crate::dataloader::{
    DoubleDatasetDataLoader, Sampler, SingleDatasetDataLoader, TcrDataLoader, TcrDataset,
};
use crate::nn::bert::{AminoAcidTokenProjector, Bert};
use crate::nn::delegate::VectorRepresentationDelegate;
use crate::nn::self_attention::{SelfAttentionStack, DEFAULT_DROPOUT};
use crate::nn::state_dict::read_state_dict;
use crate::nn::token_embedder::TokenEmbedder;
use crate::shared::amino_acids::CompartmentScheme;
use crate::shared::{GeneOracle, TcrlmError};
use crate::tokeniser::{NoiseParameters, Tokeniser};
use anyhow::Result;
use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub class: String,
    #[serde(default)]
    pub initargs: Value,
}

impl ComponentConfig {
    pub fn new(class: &str, initargs: Value) -> ComponentConfig {
        ComponentConfig {
            class: class.to_string(),
            initargs,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub token_embedder: ComponentConfig,
    pub self_attention_stack: ComponentConfig,
    pub mlm_token_prediction_projector: ComponentConfig,
    pub vector_representation_delegate: ComponentConfig,
    #[serde(default)]
    pub path_to_pretrained_state_dict: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub csv_paths: Vec<String>,
    pub dataloader: ComponentConfig,
}

fn default_batch_collator() -> ComponentConfig {
    ComponentConfig::new("DefaultBatchCollator", Value::Null)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub tokeniser: ComponentConfig,
    #[serde(default = "default_batch_collator")]
    pub batch_collator: ComponentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_data: Option<DataSourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_data: Option<DataSourceConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_epochs: Option<usize>,
}

/// Deserialize `initargs` for `class`, a null value standing for `{}`.
fn initargs<T: DeserializeOwned>(class: &str, value: &Value) -> Result<T> {
    let value = match value {
        Value::Null => Value::Object(Default::default()),
        v => v.clone(),
    };
    serde_json::from_value(value).map_err(|e| {
        TcrlmError::configuration(format!("bad initargs for {}: {}", class, e)).into()
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbeddingDimArgs {
    embedding_dim: usize,
}

fn default_dropout() -> f64 {
    DEFAULT_DROPOUT
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BuiltinsStackArgs {
    num_layers: usize,
    d_model: usize,
    nhead: usize,
    #[serde(default = "default_dropout")]
    dropout: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InitialProjectionStackArgs {
    num_layers: usize,
    embedding_dim: usize,
    d_model: usize,
    nhead: usize,
    #[serde(default = "default_dropout")]
    dropout: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectorArgs {
    d_model: usize,
}

fn default_p_censor() -> f64 {
    DEFAULT_P_CENSOR
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ClCollatorArgs {
    #[serde(default)]
    supervised: bool,
    #[serde(default = "default_p_censor")]
    p_censor: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SingleLoaderArgs {
    batch_size: usize,
    #[serde(default)]
    shuffle: bool,
    #[serde(default)]
    seed: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DoubleLoaderArgs {
    batch_size_1: usize,
    batch_size_2: usize,
    #[serde(default)]
    seed: u64,
    // worker processes have no counterpart here
    #[serde(default)]
    #[allow(dead_code)]
    num_workers_per_dataset: usize,
    #[serde(default)]
    distributed: bool,
}

type TokeniserFactory = fn(&str, &Value) -> Result<Tokeniser>;
type EmbedderFactory = fn(&str, &Value, &mut SmallRng) -> Result<TokenEmbedder>;
type StackFactory = fn(&str, &Value, &mut SmallRng) -> Result<SelfAttentionStack>;
type ProjectorFactory = fn(&str, &Value, &mut SmallRng) -> Result<AminoAcidTokenProjector>;
type DelegateFactory = fn(&str, &Value) -> Result<VectorRepresentationDelegate>;
type CollatorFactory = fn(&str, &Value, Tokeniser) -> Result<BatchCollator>;

fn make_tokeniser(class: &str, args: &Value) -> Result<Tokeniser> {
    let noise: NoiseParameters = initargs(class, args)?;
    let tokeniser = Tokeniser::from_name(class)
        .ok_or_else(|| TcrlmError::configuration(format!("unknown tokeniser {}", class)))?;
    Ok(tokeniser.with_noise(noise))
}

pub static TOKENISERS: Lazy<HashMap<&'static str, TokeniserFactory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, TokeniserFactory> = HashMap::new();
    for name in [
        "CdrTokeniser",
        "AlphaCdrTokeniser",
        "BetaCdrTokeniser",
        "Cdr3Tokeniser",
        "BetaCdr3Tokeniser",
    ] {
        m.insert(name, make_tokeniser);
    }
    m
});

fn simple_embedder(class: &str, args: &Value, scheme: CompartmentScheme) -> Result<TokenEmbedder> {
    let NoArgs {} = initargs(class, args)?;
    Ok(TokenEmbedder::simple(class, scheme))
}

fn learned_embedder(
    class: &str,
    args: &Value,
    scheme: CompartmentScheme,
    bidirectional: bool,
    rng: &mut SmallRng,
) -> Result<TokenEmbedder> {
    let a: EmbeddingDimArgs = initargs(class, args)?;
    TokenEmbedder::learned(class, scheme, a.embedding_dim, bidirectional, rng)
}

pub static TOKEN_EMBEDDERS: Lazy<HashMap<&'static str, EmbedderFactory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, EmbedderFactory> = HashMap::new();
    m.insert("CdrSimpleEmbedder", |c, a, _| {
        simple_embedder(c, a, CompartmentScheme::Cdr)
    });
    m.insert("CdrBlosumEmbedder", |c, a, rng| {
        let NoArgs {} = initargs(c, a)?;
        Ok(TokenEmbedder::blosum(c, CompartmentScheme::Cdr, rng))
    });
    m.insert("CdrEmbedder", |c, a, rng| {
        learned_embedder(c, a, CompartmentScheme::Cdr, false, rng)
    });
    m.insert("CdrBidirectionalEmbedder", |c, a, rng| {
        learned_embedder(c, a, CompartmentScheme::Cdr, true, rng)
    });
    m.insert("SingleChainCdrSimpleEmbedder", |c, a, _| {
        simple_embedder(c, a, CompartmentScheme::SingleChainCdr)
    });
    m.insert("SingleChainCdrEmbedder", |c, a, rng| {
        learned_embedder(c, a, CompartmentScheme::SingleChainCdr, false, rng)
    });
    m.insert("Cdr3SimpleEmbedder", |c, a, _| {
        simple_embedder(c, a, CompartmentScheme::Cdr3)
    });
    m.insert("Cdr3Embedder", |c, a, rng| {
        learned_embedder(c, a, CompartmentScheme::Cdr3, false, rng)
    });
    m.insert("BetaCdr3SimpleEmbedder", |c, a, _| {
        simple_embedder(c, a, CompartmentScheme::Absent)
    });
    m
});

pub static SELF_ATTENTION_STACKS: Lazy<HashMap<&'static str, StackFactory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, StackFactory> = HashMap::new();
    m.insert("SelfAttentionStackWithBuiltins", |c, a, rng| {
        let a: BuiltinsStackArgs = initargs(c, a)?;
        SelfAttentionStack::with_builtins(a.num_layers, a.d_model, a.nhead, a.dropout, rng)
    });
    m.insert("SelfAttentionStackWithInitialProjection", |c, a, rng| {
        let a: InitialProjectionStackArgs = initargs(c, a)?;
        SelfAttentionStack::with_initial_projection(
            a.num_layers,
            a.embedding_dim,
            a.d_model,
            a.nhead,
            a.dropout,
            rng,
        )
    });
    m
});

pub static MLM_TOKEN_PREDICTION_PROJECTORS: Lazy<HashMap<&'static str, ProjectorFactory>> =
    Lazy::new(|| {
        let mut m: HashMap<&'static str, ProjectorFactory> = HashMap::new();
        m.insert("AminoAcidTokenProjector", |c, a, rng| {
            let a: ProjectorArgs = initargs(c, a)?;
            Ok(AminoAcidTokenProjector::new(a.d_model, rng))
        });
        m
    });

pub static VECTOR_REPRESENTATION_DELEGATES: Lazy<HashMap<&'static str, DelegateFactory>> =
    Lazy::new(|| {
        let mut m: HashMap<&'static str, DelegateFactory> = HashMap::new();
        m.insert("ClsVectorRepresentationDelegate", |c, a| {
            let NoArgs {} = initargs(c, a)?;
            Ok(VectorRepresentationDelegate::Cls)
        });
        m.insert("AveragePoolVectorRepresentationDelegate", |c, a| {
            let NoArgs {} = initargs(c, a)?;
            Ok(VectorRepresentationDelegate::AveragePool)
        });
        m
    });

pub static BATCH_COLLATORS: Lazy<HashMap<&'static str, CollatorFactory>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, CollatorFactory> = HashMap::new();
    m.insert("DefaultBatchCollator", |c, a, t| {
        let NoArgs {} = initargs(c, a)?;
        Ok(BatchCollator::new(t, CollationObjective::Default))
    });
    m.insert("MlmBatchCollator", |c, a, t| {
        let NoArgs {} = initargs(c, a)?;
        Ok(BatchCollator::new(t, CollationObjective::Mlm))
    });
    m.insert("ClBatchCollator", |c, a, t| {
        let a: ClCollatorArgs = initargs(c, a)?;
        Ok(BatchCollator::new(
            t,
            CollationObjective::Cl {
                supervised: a.supervised,
                p_censor: a.p_censor,
            },
        ))
    });
    m.insert("NoOpCollator", |c, a, t| {
        let NoArgs {} = initargs(c, a)?;
        Ok(BatchCollator::new(t, CollationObjective::NoOp))
    });
    m
});

fn lookup<'a, F>(registry: &'a HashMap<&'static str, F>, slot: &str, class: &str) -> Result<&'a F> {
    registry.get(class).ok_or_else(|| {
        TcrlmError::configuration(format!("unknown {} class: {}", slot, class)).into()
    })
}

/// Builds components from a `Config`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigReader {
    config: Config,
}

impl ConfigReader {
    pub fn new(config: Config) -> ConfigReader {
        ConfigReader { config }
    }

    pub fn from_json_str(json: &str) -> Result<ConfigReader> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| TcrlmError::configuration(format!("bad model configuration: {}", e)))?;
        Ok(ConfigReader::new(config))
    }

    pub fn from_path(path: &Path) -> Result<ConfigReader> {
        let reader = BufReader::new(File::open(path)?);
        let config: Config = serde_json::from_reader(reader)
            .map_err(|e| TcrlmError::configuration(format!("bad model configuration: {}", e)))?;
        Ok(ConfigReader::new(config))
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn get_model_name(&self) -> &str {
        &self.config.model.name
    }

    pub fn get_num_epochs(&self) -> Result<usize> {
        self.config
            .num_epochs
            .ok_or_else(|| TcrlmError::configuration("num_epochs is not set").into())
    }

    pub fn get_tokeniser(&self) -> Result<Tokeniser> {
        let c = &self.config.data.tokeniser;
        lookup(&*TOKENISERS, "tokeniser", &c.class)?(&c.class, &c.initargs)
    }

    pub fn get_batch_collator_with_tokeniser(&self, tokeniser: Tokeniser) -> Result<BatchCollator> {
        let c = &self.config.data.batch_collator;
        lookup(&*BATCH_COLLATORS, "batch collator", &c.class)?(&c.class, &c.initargs, tokeniser)
    }

    /// Assemble the encoder with freshly initialised parameters and check
    /// that its components fit together and fit the tokeniser.
    pub fn get_bert(&self, rng: &mut SmallRng) -> Result<Bert> {
        let m = &self.config.model;
        let token_embedder = lookup(&*TOKEN_EMBEDDERS, "token embedder", &m.token_embedder.class)?(
            &m.token_embedder.class,
            &m.token_embedder.initargs,
            rng,
        )?;
        let self_attention_stack = lookup(
            &*SELF_ATTENTION_STACKS,
            "self-attention stack",
            &m.self_attention_stack.class,
        )?(
            &m.self_attention_stack.class,
            &m.self_attention_stack.initargs,
            rng,
        )?;
        let mlm_token_prediction_projector = lookup(
            &*MLM_TOKEN_PREDICTION_PROJECTORS,
            "MLM token prediction projector",
            &m.mlm_token_prediction_projector.class,
        )?(
            &m.mlm_token_prediction_projector.class,
            &m.mlm_token_prediction_projector.initargs,
            rng,
        )?;
        let vector_representation_delegate = lookup(
            &*VECTOR_REPRESENTATION_DELEGATES,
            "vector representation delegate",
            &m.vector_representation_delegate.class,
        )?(
            &m.vector_representation_delegate.class,
            &m.vector_representation_delegate.initargs,
        )?;

        if token_embedder.embedding_dim() != self_attention_stack.input_dim() {
            return Err(TcrlmError::configuration(format!(
                "{} produces {}-dimensional tokens but {} expects {}",
                token_embedder.name,
                token_embedder.embedding_dim(),
                self_attention_stack.name(),
                self_attention_stack.input_dim()
            )))?;
        }
        if mlm_token_prediction_projector.projector.in_features() != self_attention_stack.d_model() {
            return Err(TcrlmError::configuration(format!(
                "MLM projector d_model {} does not match the stack's {}",
                mlm_token_prediction_projector.projector.in_features(),
                self_attention_stack.d_model()
            )))?;
        }
        token_embedder.check_compatible_with(&self.get_tokeniser()?)?;

        log::debug!(
            "Assembled {} from {} + {} ({} layers, d_model {}) + {}",
            m.name,
            token_embedder.name,
            self_attention_stack.name(),
            self_attention_stack.num_layers(),
            self_attention_stack.d_model(),
            vector_representation_delegate.name()
        );

        Ok(Bert {
            token_embedder,
            self_attention_stack,
            mlm_token_prediction_projector,
            vector_representation_delegate,
        })
    }

    /// `get_bert`, then load `path_to_pretrained_state_dict` when set.
    /// Relative paths are taken from `base_dir`.
    pub fn get_bert_with_pretrained_parameters_if_available(
        &self,
        base_dir: &Path,
        rng: &mut SmallRng,
    ) -> Result<Bert> {
        let mut bert = self.get_bert(rng)?;
        if let Some(path) = &self.config.model.path_to_pretrained_state_dict {
            let path = resolve(base_dir, path);
            log::info!("Loading pretrained parameters from {}", path.display());
            bert.load_state_dict(&read_state_dict(&path)?)?;
        }
        Ok(bert)
    }

    pub fn get_training_dataloader(&self, base_dir: &Path, oracle: &dyn GeneOracle) -> Result<Box<dyn TcrDataLoader>> {
        let source = self
            .config
            .data
            .training_data
            .as_ref()
            .ok_or_else(|| TcrlmError::configuration("no training_data section"))?;
        self.get_dataloader(source, base_dir, oracle, true)
    }

    pub fn get_validation_dataloader(
        &self,
        base_dir: &Path,
        oracle: &dyn GeneOracle,
    ) -> Result<Box<dyn TcrDataLoader>> {
        let source = self
            .config
            .data
            .validation_data
            .as_ref()
            .ok_or_else(|| TcrlmError::configuration("no validation_data section"))?;
        self.get_dataloader(source, base_dir, oracle, false)
    }

    fn get_dataloader(
        &self,
        source: &DataSourceConfig,
        base_dir: &Path,
        oracle: &dyn GeneOracle,
        training: bool,
    ) -> Result<Box<dyn TcrDataLoader>> {
        let collator = self.get_batch_collator_with_tokeniser(self.get_tokeniser()?)?;
        let dataset = |i: usize| -> Result<Arc<TcrDataset>> {
            let path = source.csv_paths.get(i).ok_or_else(|| {
                TcrlmError::configuration(format!("{} needs csv path #{}", source.dataloader.class, i + 1))
            })?;
            Ok(Arc::new(TcrDataset::from_csv_path(&resolve(base_dir, path), oracle)?))
        };

        let class = source.dataloader.class.as_str();
        match class {
            "SingleDatasetDataLoader" => {
                let a: SingleLoaderArgs = initargs(class, &source.dataloader.initargs)?;
                let sampler = Sampler {
                    shuffle: a.shuffle || training,
                    seed: a.seed,
                    ..Default::default()
                };
                Ok(Box::new(SingleDatasetDataLoader::new(
                    dataset(0)?,
                    collator,
                    a.batch_size,
                    sampler,
                )))
            }
            "DoubleDatasetDataLoader" | "DistributedDoubleDatasetDataLoader" => {
                let a: DoubleLoaderArgs = initargs(class, &source.dataloader.initargs)?;
                let sampler = Sampler {
                    shuffle: a.distributed,
                    seed: a.seed,
                    ..Default::default()
                };
                Ok(Box::new(DoubleDatasetDataLoader::new(
                    dataset(0)?,
                    dataset(1)?,
                    collator,
                    a.batch_size_1,
                    a.batch_size_2,
                    sampler,
                )))
            }
            _ => Err(TcrlmError::configuration(format!(
                "unknown data loader class: {}",
                class
            ))
            .into()),
        }
    }
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        base_dir.join(p)
    }
}
