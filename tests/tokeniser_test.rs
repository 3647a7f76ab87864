mod common;
use anyhow::Result;
use ndarray::array;
use std::collections::HashSet;
use tcrlm::shared::amino_acids::{CompartmentScheme, CLS};
use tcrlm::shared::TcrlmError;
use tcrlm::tokeniser::{NoiseParameters, Tokeniser, COMPARTMENT_ID_FIELD, TOKEN_ID_FIELD};

fn full_tcr() -> tcrlm::Tcr {
    common::tcr(
        Some("TRAV38-1*01"),
        Some("CAHRSAGGGTSYGKLTF"),
        Some("TRBV2*01"),
        Some("CASSEFQGDNEQFF"),
    )
}

#[test]
fn cdr_tokeniser_emits_cls_then_every_residue() -> Result<()> {
    let tokeniser = Tokeniser::from_name("CdrTokeniser").unwrap();
    let tokens = tokeniser.tokenise(&full_tcr(), 0)?;

    // TSENNYY + QEAYKQQN + CDR3A + SNHLY + FYNNEI + CDR3B
    assert_eq!(tokens.nrows(), 1 + 7 + 8 + 17 + 5 + 6 + 14);
    assert_eq!(tokens.ncols(), 4);
    assert_eq!(tokens.row(0), array![CLS, 0, 0, 0]);
    // first residue of CDR1A is T
    assert_eq!(tokens.row(1), array![19usize, 1, 7, 1]);
    // last residue of CDR3B is F, in compartment 6
    assert_eq!(tokens.row(tokens.nrows() - 1), array![7usize, 14, 14, 6]);

    let compartments: Vec<usize> = tokens.column(COMPARTMENT_ID_FIELD).iter().copied().collect();
    let mut sorted = compartments.clone();
    sorted.sort();
    assert_eq!(compartments, sorted);
    Ok(())
}

#[test]
fn beta_cdr3_tokeniser_has_three_fields() -> Result<()> {
    let tokeniser = Tokeniser::from_name("BetaCdr3Tokeniser").unwrap();
    assert_eq!(tokeniser.compartment_scheme(), CompartmentScheme::Absent);
    let tokens = tokeniser.tokenise(&full_tcr(), 0)?;
    assert_eq!(tokens.dim(), (15, 3));
    assert_eq!(tokens.row(0), array![CLS, 0, 0]);
    assert_eq!(tokens.row(1), array![4usize, 1, 14]);
    Ok(())
}

#[test]
fn cdr3_tokeniser_numbers_the_two_junctions() -> Result<()> {
    let tokeniser = Tokeniser::from_name("Cdr3Tokeniser").unwrap();
    let tokens = tokeniser.tokenise(&full_tcr(), 0)?;
    assert_eq!(tokens.nrows(), 1 + 17 + 14);
    let ids: HashSet<usize> = tokens.column(COMPARTMENT_ID_FIELD).iter().copied().collect();
    assert_eq!(ids, HashSet::from([0, 1, 2]));
    Ok(())
}

#[test]
fn single_chain_tokeniser_ignores_the_other_chain() -> Result<()> {
    let tokeniser = Tokeniser::from_name("AlphaCdrTokeniser").unwrap();
    let tokens = tokeniser.tokenise(&full_tcr(), 0)?;
    assert_eq!(tokens.nrows(), 1 + 7 + 8 + 17);
    assert_eq!(tokens[[tokens.nrows() - 1, COMPARTMENT_ID_FIELD]], 3);
    Ok(())
}

#[test]
fn absent_compartments_emit_nothing() -> Result<()> {
    let tokeniser = Tokeniser::from_name("CdrTokeniser").unwrap();
    let beta_only = common::tcr(None, None, Some("TRBV2*01"), None);
    let tokens = tokeniser.tokenise(&beta_only, 0)?;
    assert_eq!(tokens.nrows(), 1 + 5 + 6);
    Ok(())
}

#[test]
fn empty_record_is_missing_input() {
    let tokeniser = Tokeniser::from_name("CdrTokeniser").unwrap();
    let empty = common::tcr(None, None, None, None);
    let err = tokeniser.tokenise(&empty, 5).unwrap_err();
    match err.downcast_ref::<TcrlmError>() {
        Some(TcrlmError::MissingInput { row, .. }) => assert_eq!(*row, 5),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn single_chain_tokeniser_needs_its_chain() {
    let tokeniser = Tokeniser::from_name("BetaCdrTokeniser").unwrap();
    let alpha_only = common::tcr(Some("TRAV3*01"), Some("CAVDNARLMF"), None, None);
    let err = tokeniser.tokenise(&alpha_only, 2).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TcrlmError>(),
        Some(TcrlmError::MissingInput { row: 2, .. })
    ));
}

#[test]
fn residue_dropout_keeps_structure() -> Result<()> {
    let tokeniser = Tokeniser::from_name("CdrTokeniser")
        .unwrap()
        .with_noise(NoiseParameters::residues_only(0.5));
    let full = tokeniser.tokenise(&full_tcr(), 0)?;
    let mut rng = common::seeded_rng();
    for _ in 0..20 {
        let noised = tokeniser.tokenise_noised(&full_tcr(), 0, &mut rng)?;
        assert_eq!(noised.row(0), array![CLS, 0, 0, 0]);
        assert!(noised.nrows() <= full.nrows());
        for row in noised.rows().into_iter().skip(1) {
            assert!(row[1] >= 1 && row[1] <= row[2]);
        }
        // no compartment is ever emptied
        let ids: HashSet<usize> = noised.column(COMPARTMENT_ID_FIELD).iter().copied().collect();
        assert_eq!(ids.len(), 7);
    }
    Ok(())
}

#[test]
fn dropping_every_loop_falls_back_to_the_full_set() -> Result<()> {
    let tokeniser = Tokeniser::from_name("CdrTokeniser").unwrap();
    let noise = NoiseParameters {
        p_drop_cdr: 1.0,
        ..Default::default()
    };
    let mut rng = common::seeded_rng();
    let noised = tokeniser.tokenise_with_noise(&full_tcr(), 0, &noise, &mut rng)?;
    assert_eq!(noised, tokeniser.tokenise(&full_tcr(), 0)?);
    Ok(())
}

#[test]
fn chain_dropout_removes_exactly_one_chain() -> Result<()> {
    let tokeniser = Tokeniser::from_name("CdrTokeniser").unwrap();
    let noise = NoiseParameters {
        p_drop_chain: 1.0,
        ..Default::default()
    };
    let mut rng = common::seeded_rng();
    for _ in 0..10 {
        let noised = tokeniser.tokenise_with_noise(&full_tcr(), 0, &noise, &mut rng)?;
        let ids: HashSet<usize> = noised
            .column(COMPARTMENT_ID_FIELD)
            .iter()
            .copied()
            .filter(|&c| c != 0)
            .collect();
        let alpha = ids.iter().any(|&c| c <= 3);
        let beta = ids.iter().any(|&c| c >= 4);
        assert!(alpha ^ beta);
        assert_eq!(noised[[0, TOKEN_ID_FIELD]], CLS);
    }
    Ok(())
}
