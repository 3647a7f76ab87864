mod common;
use anyhow::Result;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde_json::json;
use tcrlm::config::ComponentConfig;
use tcrlm::{CollationObjective, Config, ConfigReader, TcrlmError};

fn is_configuration_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::Configuration(_))
    )
}

fn bert_error(config: Config) -> anyhow::Error {
    let mut rng = SmallRng::seed_from_u64(0);
    ConfigReader::new(config).get_bert(&mut rng).unwrap_err()
}

#[test]
fn every_registered_embedder_assembles() -> Result<()> {
    let cases = [
        ("CdrTokeniser", "CdrSimpleEmbedder", 29),
        ("CdrTokeniser", "CdrBlosumEmbedder", 27),
        ("AlphaCdrTokeniser", "SingleChainCdrSimpleEmbedder", 26),
        ("BetaCdrTokeniser", "SingleChainCdrSimpleEmbedder", 26),
        ("Cdr3Tokeniser", "Cdr3SimpleEmbedder", 25),
        ("BetaCdr3Tokeniser", "BetaCdr3SimpleEmbedder", 23),
    ];
    let mut rng = SmallRng::seed_from_u64(0);
    for (tokeniser, embedder, dim) in cases {
        let reader = ConfigReader::new(common::simple_config(tokeniser, embedder, dim));
        let bert = reader.get_bert(&mut rng)?;
        assert_eq!(bert.token_embedder.embedding_dim(), dim);
        assert_eq!(bert.d_model(), 8);
        assert_eq!(reader.get_tokeniser()?.name(), tokeniser);
    }

    for embedder in ["CdrEmbedder", "CdrBidirectionalEmbedder"] {
        let reader = ConfigReader::new(common::small_config(
            embedder,
            "ClsVectorRepresentationDelegate",
        ));
        assert_eq!(reader.get_bert(&mut rng)?.d_model(), 16);
    }
    Ok(())
}

#[test]
fn unknown_class_is_a_configuration_error() {
    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.model.vector_representation_delegate =
        ComponentConfig::new("MaxPoolVectorRepresentationDelegate", json!({}));
    assert!(is_configuration_error(&bert_error(config)));

    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.data.tokeniser = ComponentConfig::new("GammaDeltaTokeniser", json!({}));
    let err = ConfigReader::new(config).get_tokeniser().unwrap_err();
    assert!(is_configuration_error(&err));
}

#[test]
fn initargs_are_checked() {
    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.model.token_embedder = ComponentConfig::new("CdrEmbedder", json!({}));
    assert!(is_configuration_error(&bert_error(config)));

    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.model.self_attention_stack = ComponentConfig::new(
        "SelfAttentionStackWithBuiltins",
        json!({"num_layers": 2, "d_model": 16, "nhead": 4, "activation": "gelu"}),
    );
    assert!(is_configuration_error(&bert_error(config)));
}

#[test]
fn stack_hyperparameters_are_validated() {
    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.model.self_attention_stack = ComponentConfig::new(
        "SelfAttentionStackWithBuiltins",
        json!({"num_layers": 2, "d_model": 16, "nhead": 3}),
    );
    assert!(is_configuration_error(&bert_error(config)));

    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.model.self_attention_stack = ComponentConfig::new(
        "SelfAttentionStackWithBuiltins",
        json!({"num_layers": 0, "d_model": 16, "nhead": 4}),
    );
    assert!(is_configuration_error(&bert_error(config)));
}

#[test]
fn embedder_must_fit_the_tokeniser() {
    let config = common::simple_config("Cdr3Tokeniser", "CdrSimpleEmbedder", 29);
    assert!(is_configuration_error(&bert_error(config)));
}

#[test]
fn dimensions_must_agree() {
    let config = common::simple_config("CdrTokeniser", "CdrSimpleEmbedder", 30);
    assert!(is_configuration_error(&bert_error(config)));

    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.model.mlm_token_prediction_projector =
        ComponentConfig::new("AminoAcidTokenProjector", json!({"d_model": 32}));
    assert!(is_configuration_error(&bert_error(config)));
}

#[test]
fn batch_collators_are_built_from_the_data_section() -> Result<()> {
    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.data.batch_collator = ComponentConfig::new("ClBatchCollator", json!({"supervised": true}));
    let reader = ConfigReader::new(config);
    let collator = reader.get_batch_collator_with_tokeniser(reader.get_tokeniser()?)?;
    assert_eq!(collator.name(), "ClBatchCollator");
    assert_eq!(
        collator.objective,
        CollationObjective::Cl {
            supervised: true,
            p_censor: 0.2
        }
    );
    Ok(())
}

#[test]
fn tokeniser_noise_comes_from_initargs() -> Result<()> {
    let mut config = common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate");
    config.data.tokeniser = ComponentConfig::new("CdrTokeniser", json!({"p_drop_aa": 0.1}));
    let tokeniser = ConfigReader::new(config).get_tokeniser()?;
    assert_eq!(tokeniser.noise.p_drop_aa, 0.1);
    assert_eq!(tokeniser.noise.p_drop_chain, 0.);
    Ok(())
}

#[test]
fn config_reads_from_json() -> Result<()> {
    let json = serde_json::to_string(&common::small_config(
        "CdrEmbedder",
        "AveragePoolVectorRepresentationDelegate",
    ))?;
    let reader = ConfigReader::from_json_str(&json)?;
    assert_eq!(reader.get_model_name(), "TestSceptr");
    assert!(is_configuration_error(&reader.get_num_epochs().unwrap_err()));

    let err = ConfigReader::from_json_str("{\"model\": {}}").unwrap_err();
    assert!(is_configuration_error(&err));
    Ok(())
}

#[test]
fn pretrained_state_is_loaded_relative_to_the_base_dir() -> Result<()> {
    let model = common::small_model()?;
    let dir = tempfile::tempdir()?;
    model.save(dir.path())?;

    let mut config = model.config().clone();
    config.model.path_to_pretrained_state_dict = Some("state_dict.json".to_string());
    let mut rng = SmallRng::seed_from_u64(99);
    let bert = ConfigReader::new(config).get_bert_with_pretrained_parameters_if_available(dir.path(), &mut rng)?;
    assert_eq!(&bert, model.bert());
    Ok(())
}
