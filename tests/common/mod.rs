use anyhow::Result;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde_json::json;
use std::path::Path;
use tcrlm::shared::ReferenceGeneTable;
use tcrlm::{make_tcr_from_components, Config, Sceptr, Tcr, TcrRow, TcrTable};

#[cfg(test)]
#[allow(dead_code)]
pub fn seeded_rng() -> SmallRng {
    SmallRng::seed_from_u64(42)
}

#[cfg(test)]
#[allow(dead_code)]
pub fn tcr(trav: Option<&str>, cdr3a: Option<&str>, trbv: Option<&str>, cdr3b: Option<&str>) -> Tcr {
    make_tcr_from_components(trav, cdr3a, trbv, cdr3b, ReferenceGeneTable::builtin()).unwrap()
}

/// Four paired TCRs with known reference alleles
#[cfg(test)]
#[allow(dead_code)]
pub fn paired_table() -> TcrTable {
    TcrTable::new(vec![
        TcrRow::new(
            Some("TRAV38-1*01"),
            Some("CAHRSAGGGTSYGKLTF"),
            Some("TRBV2*01"),
            Some("CASSEFQGDNEQFF"),
        ),
        TcrRow::new(
            Some("TRAV3*01"),
            Some("CAVDNARLMF"),
            Some("TRBV25-1*01"),
            Some("CASSDGSFNEQFF"),
        ),
        TcrRow::new(
            Some("TRAV13-2*01"),
            Some("CAERIRKGQVLTGGGNKLTF"),
            Some("TRBV9*01"),
            Some("CASSVGDLLTGELFF"),
        ),
        TcrRow::new(
            Some("TRAV38-2/DV8*01"),
            Some("CAYRSAGGGTSYGKLTF"),
            Some("TRBV2*01"),
            Some("CASSPGTGGNEQYF"),
        ),
    ])
}

#[cfg(test)]
#[allow(dead_code)]
pub fn beta_only_table() -> TcrTable {
    TcrTable::new(vec![
        TcrRow::new(None, None, Some("TRBV2*01"), Some("CASSEFQGDNEQFF")),
        TcrRow::new(None, None, Some("TRBV2*01"), Some("CASSEFQGDNEQFF")),
        TcrRow::new(None, None, Some("TRBV9*01"), Some("CASSVGDLLTGELFF")),
    ])
}

/// A small CdrTokeniser model, `d_model` 16 and two layers
#[cfg(test)]
#[allow(dead_code)]
pub fn small_config(embedder: &str, delegate: &str) -> Config {
    serde_json::from_value(json!({
        "model": {
            "name": "TestSceptr",
            "token_embedder": {"class": embedder, "initargs": {"embedding_dim": 16}},
            "self_attention_stack": {
                "class": "SelfAttentionStackWithBuiltins",
                "initargs": {"num_layers": 2, "d_model": 16, "nhead": 4}
            },
            "mlm_token_prediction_projector": {
                "class": "AminoAcidTokenProjector",
                "initargs": {"d_model": 16}
            },
            "vector_representation_delegate": {"class": delegate, "initargs": {}},
            "path_to_pretrained_state_dict": null
        },
        "data": {
            "tokeniser": {"class": "CdrTokeniser", "initargs": {}},
            "batch_collator": {"class": "DefaultBatchCollator", "initargs": {}}
        }
    }))
    .unwrap()
}

/// A fixed-embedding model with an initial projection into the stack
#[cfg(test)]
#[allow(dead_code)]
pub fn simple_config(tokeniser: &str, embedder: &str, embedding_dim: usize) -> Config {
    serde_json::from_value(json!({
        "model": {
            "name": "TestSimple",
            "token_embedder": {"class": embedder, "initargs": {}},
            "self_attention_stack": {
                "class": "SelfAttentionStackWithInitialProjection",
                "initargs": {
                    "num_layers": 2, "embedding_dim": embedding_dim, "d_model": 8, "nhead": 2
                }
            },
            "mlm_token_prediction_projector": {
                "class": "AminoAcidTokenProjector",
                "initargs": {"d_model": 8}
            },
            "vector_representation_delegate": {
                "class": "AveragePoolVectorRepresentationDelegate",
                "initargs": {}
            }
        },
        "data": {
            "tokeniser": {"class": tokeniser, "initargs": {}}
        }
    }))
    .unwrap()
}

#[cfg(test)]
#[allow(dead_code)]
pub fn small_model() -> Result<Sceptr> {
    Sceptr::from_config(
        small_config("CdrEmbedder", "AveragePoolVectorRepresentationDelegate"),
        Path::new("."),
        7,
    )
}
