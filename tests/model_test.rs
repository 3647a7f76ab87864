mod common;
use anyhow::Result;
use std::path::Path;
use tcrlm::nn::state_dict::TensorRecord;
use ndarray::{s, Array1};
use tcrlm::{
    calc_cdist_matrix, calc_vector_representations, BatchCollator, CollatedBatch,
    CollationObjective, DefaultModel, Device, ReferenceGeneTable, Sceptr, TcrTable, TcrlmError,
};

fn csv_table(csv: &str) -> Result<TcrTable> {
    TcrTable::from_csv_reader(csv.as_bytes())
}

#[test]
fn identical_tcrs_embed_identically() -> Result<()> {
    let model = common::small_model()?;
    let reps = model.calc_vector_representations(&common::beta_only_table())?;
    assert_eq!(reps.dim(), (3, 16));
    for row in reps.rows() {
        let norm = row.dot(&row).sqrt();
        assert!((norm - 1.).abs() < 1e-4);
    }
    let diff = &reps.row(0) - &reps.row(1);
    assert!(diff.dot(&diff).sqrt() < 1e-5);
    Ok(())
}

#[test]
fn cdist_is_symmetric_with_zero_diagonal() -> Result<()> {
    let model = common::small_model()?;
    let table = common::paired_table();
    let cdist = model.calc_cdist_matrix(&table, &table)?;
    assert_eq!(cdist.dim(), (4, 4));
    for i in 0..4 {
        assert!(cdist[[i, i]].abs() < 1e-3);
        for j in 0..4 {
            assert!((cdist[[i, j]] - cdist[[j, i]]).abs() < 1e-4);
            assert!(cdist[[i, j]] >= 0. && cdist[[i, j]] <= 2. + 1e-4);
        }
    }
    Ok(())
}

#[test]
fn pdist_matches_the_upper_triangle_of_cdist() -> Result<()> {
    let model = common::small_model()?;
    let table = common::paired_table();
    let pdist = model.calc_pdist_vector(&table)?;
    let cdist = model.calc_cdist_matrix(&table, &table)?;
    assert_eq!(pdist.len(), 6);
    let mut k = 0;
    for i in 0..4 {
        for j in i + 1..4 {
            assert!((pdist[k] - cdist[[i, j]]).abs() < 1e-4);
            k += 1;
        }
    }
    Ok(())
}

#[test]
fn embedding_does_not_depend_on_batching() -> Result<()> {
    let mut model = common::small_model()?;
    let table = common::paired_table();
    let all_at_once = model.calc_vector_representations(&table)?;
    model.set_batch_size(1)?;
    let one_by_one = model.calc_vector_representations(&table)?;
    for (a, b) in all_at_once.iter().zip(one_by_one.iter()) {
        assert!((a - b).abs() < 1e-5);
    }
    assert!(model.set_batch_size(0).is_err());
    Ok(())
}

#[test]
fn accelerated_device_gives_the_same_result() -> Result<()> {
    let mut model = common::small_model()?;
    let table = common::paired_table();
    let on_cpu = model.calc_vector_representations(&table)?;
    model.enable_hardware_acceleration();
    let accelerated = model.calc_vector_representations(&table)?;
    model.disable_hardware_acceleration();
    for (a, b) in on_cpu.iter().zip(accelerated.iter()) {
        assert!((a - b).abs() < 1e-6);
    }
    Ok(())
}

#[test]
fn average_pool_skips_cls_and_padding() -> Result<()> {
    let model = common::small_model()?;
    let pairs = common::paired_table().generate_tcr_pmhc_series(ReferenceGeneTable::builtin())?;
    let collator = BatchCollator::new(model.tokeniser().clone(), CollationObjective::Default);
    let batch = match collator.collate(&pairs, 0, &mut common::seeded_rng())? {
        CollatedBatch::Default(batch) => batch,
        other => panic!("unexpected batch {:?}", other),
    };

    let reps = model.bert().get_vector_representations_of(&batch, Device::Cpu)?;
    let tokens = model
        .bert()
        .get_token_embeddings_at_penultimate_layer(&batch, Device::Cpu)?;
    for i in 0..batch.shape()[0] {
        let mut total = Array1::<f32>::zeros(16);
        let mut count = 0f32;
        for j in 1..batch.shape()[1] {
            if batch[[i, j, 0]] != 0 {
                total += &tokens.slice(s![i, j, ..]);
                count += 1.;
            }
        }
        let mean = total / count;
        let expected = &mean / mean.dot(&mean).sqrt();
        for (a, b) in reps.row(i).iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{} != {}", a, b);
        }

        let cls = tokens.slice(s![i, 0, ..]);
        let with_cls: Array1<f32> = (&mean * count + &cls) / (count + 1.);
        let with_cls = &with_cls / with_cls.dot(&with_cls).sqrt();
        assert!(reps
            .row(i)
            .iter()
            .zip(with_cls.iter())
            .any(|(a, b)| (a - b).abs() > 1e-4));
    }
    Ok(())
}

#[test]
fn cls_delegate_also_gives_unit_vectors() -> Result<()> {
    let model = Sceptr::from_config(
        common::small_config("CdrEmbedder", "ClsVectorRepresentationDelegate"),
        Path::new("."),
        3,
    )?;
    let reps = model.calc_vector_representations(&common::paired_table())?;
    for row in reps.rows() {
        assert!((row.dot(&row).sqrt() - 1.).abs() < 1e-4);
    }
    Ok(())
}

#[test]
fn csv_input_without_pmhc_columns() -> Result<()> {
    let table = csv_table(
        "TRAV,CDR3A,TRBV,CDR3B\n\
         TRAV38-1*01,CAHRSAGGGTSYGKLTF,TRBV2*01,CASSEFQGDNEQFF\n\
         ,,TRBV9*01,CASSVGDLLTGELFF\n",
    )?;
    assert_eq!(table.len(), 2);
    let reps = common::small_model()?.calc_vector_representations(&table)?;
    assert_eq!(reps.nrows(), 2);
    Ok(())
}

#[test]
fn empty_table_gives_empty_output() -> Result<()> {
    let reps = common::small_model()?.calc_vector_representations(&TcrTable::new(vec![]))?;
    assert_eq!(reps.dim(), (0, 16));
    Ok(())
}

#[test]
fn row_without_usable_data_is_reported() -> Result<()> {
    let mut model = common::small_model()?;
    model.set_batch_size(2)?;
    let table = csv_table(
        "TRAV,CDR3A,TRBV,CDR3B\n\
         ,,TRBV2*01,CASSEFQGDNEQFF\n\
         ,,TRBV2*01,CASSEFQGDNEQFF\n\
         ,,,\n",
    )?;
    let err = model.calc_vector_representations(&table).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::MissingInput { row: 2, .. })
    ));
    Ok(())
}

#[test]
fn residue_representations_for_paired_cdr_models() -> Result<()> {
    let model = common::small_model()?;
    let table = common::beta_only_table();
    let residues = model.calc_residue_representations(&table)?;

    // TRBV9: SGDLS + YYNGEE + CASSVGDLLTGELFF
    let longest = 5 + 6 + 15;
    assert_eq!(residues.representation_array.dim(), (3, longest, 16));
    assert_eq!(residues.compartment_mask.dim(), (3, longest));
    assert_eq!(residues.compartment_mask[[0, 0]], 4);
    assert_eq!(residues.compartment_mask[[2, longest - 1]], 6);
    // TRBV2 rows are shorter: SNHLY + FYNNEI + CASSEFQGDNEQFF
    assert_eq!(residues.compartment_mask[[0, 25]], 0);
    assert_eq!(
        residues.to_string(),
        "ResidueRepresentations[num_tcrs: 3, rep_dim: 16]"
    );
    Ok(())
}

#[test]
fn residue_representations_need_the_paired_cdr_scheme() -> Result<()> {
    let model = Sceptr::from_config(
        common::simple_config("BetaCdr3Tokeniser", "BetaCdr3SimpleEmbedder", 23),
        Path::new("."),
        1,
    )?;
    let err = model
        .calc_residue_representations(&common::beta_only_table())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::Unsupported(_))
    ));
    Ok(())
}

#[test]
fn save_and_load_round_trip() -> Result<()> {
    let model = common::small_model()?;
    let dir = tempfile::tempdir()?;
    model.save(dir.path())?;

    let loaded = Sceptr::load(dir.path())?;
    assert_eq!(loaded.name, "TestSceptr");
    assert_eq!(loaded.bert(), model.bert());

    let table = common::paired_table();
    assert_eq!(
        loaded.calc_vector_representations(&table)?,
        model.calc_vector_representations(&table)?
    );
    Ok(())
}

#[test]
fn load_needs_a_parameter_state() -> Result<()> {
    let dir = tempfile::tempdir()?;
    common::small_model()?.save(dir.path())?;
    std::fs::remove_file(dir.path().join("state_dict.json"))?;

    let err = Sceptr::load(dir.path()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::Configuration(_))
    ));
    let default_model = DefaultModel::new(dir.path());
    assert!(calc_vector_representations(&default_model, &common::paired_table()).is_err());
    Ok(())
}

#[test]
fn default_model_loads_lazily() -> Result<()> {
    let dir = tempfile::tempdir()?;
    common::small_model()?.save(dir.path())?;

    let mut default_model = DefaultModel::new(dir.path());
    default_model.enable_hardware_acceleration();
    assert!(!default_model.is_loaded());
    let table = common::paired_table();
    let reps = calc_vector_representations(&default_model, &table)?;
    assert!(default_model.is_loaded());
    assert_eq!(reps.nrows(), 4);
    assert_eq!(calc_cdist_matrix(&default_model, &table, &table)?.dim(), (4, 4));
    Ok(())
}

#[test]
fn default_model_reports_a_missing_save() {
    let default_model = DefaultModel::new(Path::new("/nonexistent/model/dir"));
    assert!(calc_vector_representations(&default_model, &common::paired_table()).is_err());
    assert!(!default_model.is_loaded());
}

#[test]
fn state_dict_names_follow_the_module_tree() -> Result<()> {
    let model = common::small_model()?;
    let state = model.bert().state_dict();
    for name in [
        "_token_embedder.token_embedding.weight",
        "_token_embedder.compartment_embedding.weight",
        "_self_attention_stack._self_attention_stack.layers.0.self_attn.in_proj_weight",
        "_self_attention_stack._self_attention_stack.layers.1.norm2.bias",
        "_mlm_token_prediction_projector.projector.weight",
    ] {
        assert!(state.contains_key(name), "missing {}", name);
    }
    assert_eq!(state["_token_embedder.token_embedding.weight"].shape, vec![23, 16]);
    assert_eq!(state["_token_embedder.compartment_embedding.weight"].shape, vec![7, 16]);
    assert_eq!(
        state["_self_attention_stack._self_attention_stack.layers.0.self_attn.in_proj_weight"].shape,
        vec![48, 16]
    );
    assert_eq!(
        state["_self_attention_stack._self_attention_stack.layers.0.linear1.weight"].shape,
        vec![64, 16]
    );
    assert_eq!(state["_mlm_token_prediction_projector.projector.weight"].shape, vec![20, 16]);
    Ok(())
}

#[test]
fn fixed_tables_are_not_parameters() -> Result<()> {
    let model = Sceptr::from_config(
        common::simple_config("CdrTokeniser", "CdrSimpleEmbedder", 29),
        Path::new("."),
        1,
    )?;
    let state = model.bert().state_dict();
    assert!(state.keys().all(|k| !k.starts_with("_token_embedder")));
    assert_eq!(state["_self_attention_stack._initial_projector.weight"].shape, vec![8, 29]);
    assert!(state.contains_key(
        "_self_attention_stack._standard_stack._self_attention_stack.layers.0.self_attn.out_proj.weight"
    ));
    Ok(())
}

#[test]
fn loading_rejects_inconsistent_state() -> Result<()> {
    let mut model = common::small_model()?;
    let state = model.bert().state_dict();

    let mut wrong_shape = state.clone();
    wrong_shape.insert(
        "_mlm_token_prediction_projector.projector.bias".to_string(),
        TensorRecord {
            shape: vec![19],
            data: vec![0.; 19],
        },
    );
    let err = model.bert_mut().load_state_dict(&wrong_shape).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::ShapeMismatch { .. })
    ));

    let mut missing = state.clone();
    missing.remove("_mlm_token_prediction_projector.projector.bias");
    let err = model.bert_mut().load_state_dict(&missing).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::MissingParameter(_))
    ));

    let mut unexpected = state.clone();
    unexpected.insert(
        "_token_embedder.position_embedding.weight".to_string(),
        TensorRecord {
            shape: vec![1],
            data: vec![0.],
        },
    );
    let err = model.bert_mut().load_state_dict(&unexpected).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::UnexpectedParameter(_))
    ));

    model.bert_mut().load_state_dict(&state)?;
    Ok(())
}
